use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;
use opentelemetry::sdk::Resource;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;

use super::TracerBuilder;
use super::TracingSetupError;

/// Export spans over OTLP/gRPC, e.g. to an OpenTelemetry collector.
#[derive(Debug, Clone, PartialEq)]
pub struct OtlpTracingConfig {
    /// Reported as `service.name`. This is the job name.
    pub service_name: String,
    /// Collector URL. The exporter's default endpoint is used if
    /// unset.
    pub url: Option<String>,
    /// Fraction of traces kept, between 0 and 1.
    pub sampling_ratio: f64,
}

impl TracerBuilder for OtlpTracingConfig {
    fn build(&self) -> Result<Tracer, TracingSetupError> {
        let exporter = match &self.url {
            Some(url) => opentelemetry_otlp::new_exporter().tonic().with_endpoint(url),
            None => opentelemetry_otlp::new_exporter().tonic(),
        };

        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                config()
                    .with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio))
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        self.service_name.clone(),
                    )])),
            )
            .install_batch(Tokio)
            .map_err(TracingSetupError::Install)
    }
}
