use std::sync::Mutex;
use std::sync::PoisonError;

use opentelemetry::global;
use opentelemetry::sdk::metrics::Aggregation;
use opentelemetry::sdk::metrics::Instrument;
use opentelemetry::sdk::metrics::MeterProvider;
use opentelemetry::sdk::metrics::Stream;
use prometheus::default_registry;
use prometheus::Encoder;
use prometheus::TextEncoder;

use crate::errors::FlowException;
use crate::errors::TrackedError;

/// Set once the exporter is registered. The default registry rejects
/// a second collector with the same descriptors.
static INITIALIZED: Mutex<bool> = Mutex::new(false);

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
///
/// Only the first successful call in a process does anything.
pub fn initialize_metrics(namespace: &str) -> Result<(), TrackedError> {
    let mut initialized = INITIALIZED.lock().unwrap_or_else(PoisonError::into_inner);
    if *initialized {
        return Ok(());
    }

    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace(namespace)
        .build()
        .reraise("error building prometheus exporter")?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            opentelemetry_sdk::metrics::new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .reraise("error building histogram view")?,
        )
        .build();
    global::set_meter_provider(provider);
    *initialized = true;
    Ok(())
}

/// Render everything in the default registry in the Prometheus text
/// format.
pub fn encode_metrics() -> Result<String, TrackedError> {
    let families = default_registry().gather();
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buf)
        .reraise("error encoding metrics")?;
    String::from_utf8(buf).reraise("metrics are not valid UTF-8")
}

#[test]
fn initialize_metrics_twice_is_ok() {
    initialize_metrics("teleflow").unwrap();
    initialize_metrics("teleflow").unwrap();

    let counter = global::meter("teleflow")
        .u64_counter("item_inp_count")
        .init();
    counter.add(1, &[opentelemetry::KeyValue::new("step_id", "metrics_test")]);
    assert!(encode_metrics().unwrap().contains("metrics_test"));
}
