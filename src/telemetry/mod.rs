//! Logging and OpenTelemetry setup for processes embedding a job engine.
//!
//! With an OTLP endpoint, job spans, engine metrics and log records are
//! exported there and also printed compactly to stderr. Without one, only
//! the stderr fmt layer is installed.

pub mod job;
pub mod metrics;

use std::fmt::Display;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::config::Config;
use crate::error::{Error, Result};

/// Service name used when the embedding process does not pick one.
pub const DEFAULT_SERVICE_NAME: &str = "jobq";

/// Every signal carries this namespace so engines embedded in different
/// services can be grouped in one backend.
pub const SERVICE_NAMESPACE: &str = "jobq";

/// Instrumentation scope of the job spans.
const TRACER_NAME: &str = "jobq.engine";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. "http://localhost:4317".
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_config(config: &Config, service_name: impl Into<String>) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: service_name.into(),
            log_level: config.log_level.clone(),
        }
    }

    /// Read `OTEL_ENDPOINT` and `LOG_LEVEL` like [`Config::from_env`], plus
    /// `JOBQ_SERVICE_NAME` (default [`DEFAULT_SERVICE_NAME`]).
    pub fn from_env() -> Result<Self> {
        let config = Config::from_env()?;
        let service_name = std::env::var("JOBQ_SERVICE_NAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
        Ok(Self::from_config(&config, service_name))
    }

    /// The resource attached to every exported span, metric and log record.
    pub fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes([
                KeyValue::new("service.namespace", SERVICE_NAMESPACE),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])
            .build()
    }
}

/// Keeps the OTLP providers alive. Dropping it flushes and shuts them down,
/// so hold it until the engine has shut down.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    logger_provider: Option<SdkLoggerProvider>,
}

impl TelemetryGuard {
    fn local() -> Self {
        Self {
            tracer_provider: None,
            meter_provider: None,
            logger_provider: None,
        }
    }

    pub fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }

    /// Push out everything buffered so far without shutting down.
    pub fn force_flush(&self) {
        if let Some(provider) = &self.tracer_provider {
            let _ = provider.force_flush();
        }
        if let Some(provider) = &self.meter_provider {
            let _ = provider.force_flush();
        }
        if let Some(provider) = &self.logger_provider {
            let _ = provider.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.logger_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.meter_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.tracer_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Install the global tracing subscriber and, with an endpoint, the OTLP
/// pipelines. The engine's `metrics` instruments report to the global meter
/// provider set here.
///
/// # Errors
///
/// Fails if an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard::local());
    };

    let resource = config.resource();
    let tracers = tracer_provider(endpoint, resource.clone())?;
    let meters = meter_provider(endpoint, resource.clone())?;
    let loggers = logger_provider(endpoint, resource)?;
    opentelemetry::global::set_meter_provider(meters.clone());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_opentelemetry::layer().with_tracer(tracers.tracer(TRACER_NAME)))
        .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&loggers))
        .try_init()
        .map_err(subscriber_error)?;

    tracing::info!(
        endpoint,
        service = %config.service_name,
        "exporting telemetry over OTLP"
    );
    Ok(TelemetryGuard {
        tracer_provider: Some(tracers),
        meter_provider: Some(meters),
        logger_provider: Some(loggers),
    })
}

fn tracer_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider> {
    use opentelemetry_otlp::WithExportConfig as _;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("span"))?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn meter_provider(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider> {
    use opentelemetry_otlp::WithExportConfig as _;

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("metric"))?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn logger_provider(endpoint: &str, resource: Resource) -> Result<SdkLoggerProvider> {
    use opentelemetry_otlp::WithExportConfig as _;

    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(exporter_error("log"))?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

fn exporter_error<E: Display>(signal: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl Display) -> Error {
    Error::Other(format!("failed to install tracing subscriber: {e}"))
}
