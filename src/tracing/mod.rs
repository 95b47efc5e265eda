//! Internal code for tracing/logging.
//!
//! This module is used to configure both tracing and logging.
//! Logging to stdout is always enabled, at least at the "ERROR" level.
//! Exporting traces over OTLP is opt-in, by setting an endpoint.
use opentelemetry::sdk::trace::Tracer;
use thiserror::Error;
use tokio::runtime::EnterGuard;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::options::PipelineOptions;

pub(crate) mod otlp_tracing;

pub use otlp_tracing::OtlpTracingConfig;

#[derive(Debug, Error)]
pub enum TracingSetupError {
    #[error("wrong log level: {0}")]
    InvalidLogLevel(String),
    #[error("error starting tracing runtime")]
    Runtime(#[source] std::io::Error),
    #[error("error installing tracer")]
    Install(#[source] opentelemetry::trace::TraceError),
    #[error("tracing initializer panicked")]
    Join(#[source] tokio::task::JoinError),
}

/// Where traces should go.
#[derive(Debug, Clone, PartialEq)]
pub enum TracingConfig {
    /// Logs only.
    Disabled,
    Otlp(OtlpTracingConfig),
}

impl TracingConfig {
    pub fn from_options(options: &PipelineOptions) -> Self {
        match &options.otlp_endpoint {
            Some(url) => Self::Otlp(OtlpTracingConfig {
                service_name: options.job_name.clone(),
                url: Some(url.clone()),
                sampling_ratio: options.sampling_ratio,
            }),
            None => Self::Disabled,
        }
    }
}

/// Each tracing backend only has to build its [`Tracer`].
trait TracerBuilder {
    fn build(&self) -> Result<Tracer, TracingSetupError>;
}

/// Utility class used to handle tracing.
///
/// It keeps a tokio runtime that is alive as long as the struct itself.
pub struct FlowTracer {
    rt: tokio::runtime::Runtime,
}

pub fn get_log_level(level: Option<&str>) -> Result<LevelFilter, TracingSetupError> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(TracingSetupError::InvalidLogLevel(level.to_string())),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

impl FlowTracer {
    pub fn new() -> Result<Self, TracingSetupError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(TracingSetupError::Runtime)?;
        Ok(Self { rt })
    }

    /// Install the global subscriber.
    ///
    /// Returns a guard that you have to keep in scope for the whole
    /// execution of the code you want to trace.
    pub fn setup(
        &self,
        conf: TracingConfig,
        log_level: Option<&str>,
    ) -> Result<EnterGuard<'_>, TracingSetupError> {
        let guard = self.rt.enter();

        let log_level = get_log_level(log_level)?;

        // We need an async block to properly initialize the tracing runtime.
        let initializer = async move {
            let logs = tracing_subscriber::fmt::Layer::default()
                .compact()
                // Show source file
                .with_file(true)
                // Display source code line numbers
                .with_line_number(true)
                // Display the thread ID an event was recorded on
                .with_thread_ids(true)
                .with_filter(Targets::new().with_target("teleflow", log_level));

            match conf {
                TracingConfig::Otlp(otlp) => {
                    let tracer = otlp.build()?;
                    let telemetry = tracing_opentelemetry::layer()
                        .with_tracer(tracer)
                        .with_filter(Targets::new().with_target("teleflow", LevelFilter::TRACE));
                    set_global_subscriber(Registry::default().with(logs).with(telemetry));
                }
                TracingConfig::Disabled => {
                    set_global_subscriber(Registry::default().with(logs));
                }
            }
            Ok::<(), TracingSetupError>(())
        };
        self.rt
            .block_on(self.rt.spawn(initializer))
            .map_err(TracingSetupError::Join)??;
        Ok(guard)
    }
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // in tests and if a pipeline is run more than once in the same
    // process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_level_parsing() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert_eq!(get_log_level(Some("warn")).unwrap(), LevelFilter::WARN);
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(TracingSetupError::InvalidLogLevel(level)) if level == "loud"
    ));
}

#[test]
fn tracing_config_follows_endpoint() {
    let mut options = PipelineOptions::default();
    assert_eq!(TracingConfig::from_options(&options), TracingConfig::Disabled);

    options.otlp_endpoint = Some("grpc://127.0.0.1:4317".to_string());
    options.sampling_ratio = 0.5;
    assert_eq!(
        TracingConfig::from_options(&options),
        TracingConfig::Otlp(OtlpTracingConfig {
            service_name: "teleflow".to_string(),
            url: Some("grpc://127.0.0.1:4317".to_string()),
            sampling_ratio: 0.5,
        })
    );
}
