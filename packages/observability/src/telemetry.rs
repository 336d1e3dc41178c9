//! Explicitly constructed tracing handle.
//!
//! [`Telemetry::init`] installs the `tracing` subscriber for the process and,
//! when an OTLP endpoint is configured, an OpenTelemetry tracer provider
//! whose spans are exported over HTTP. The provider lives inside the handle;
//! dropping the handle without calling [`Telemetry::shutdown`] loses any
//! spans still queued in the batch processor.

use crate::{LogConfig, LogFormat, TracePropagator};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::span_processor_with_async_runtime::BatchSpanProcessor;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Telemetry error type.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The OTLP exporter could not be built.
    #[error("Exporter error: {0}")]
    Exporter(String),

    /// A global subscriber was already installed.
    #[error("Subscriber error: {0}")]
    Subscriber(String),

    /// Flushing or shutting down the provider failed.
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Configuration for [`Telemetry::init`].
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Logging configuration.
    pub log: LogConfig,
    /// OTLP/HTTP traces endpoint, e.g. `http://localhost:4318/v1/traces`.
    /// `None` disables span export; logging still works.
    pub otlp_endpoint: Option<String>,
}

/// Process tracing handle with an explicit init/shutdown lifecycle.
pub struct Telemetry {
    service_name: String,
    provider: Option<SdkTracerProvider>,
    propagator: TracePropagator,
}

impl Telemetry {
    /// Install the subscriber and, if configured, the OTLP span pipeline.
    ///
    /// Must be called from within a Tokio runtime when an endpoint is set,
    /// because the batch span processor runs on it.
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        let provider = match config.otlp_endpoint.as_deref() {
            Some(endpoint) => Some(build_provider(&config.log, endpoint)?),
            None => None,
        };

        let otel_layer = provider.as_ref().map(|provider| {
            tracing_opentelemetry::layer()
                .with_tracer(provider.tracer(config.log.service_name.clone()))
        });

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log.default_level));

        let compact_layer = (config.log.format == LogFormat::Compact).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .compact()
                .with_writer(std::io::stderr)
        });
        let json_layer = (config.log.format == LogFormat::Json).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stderr)
        });

        tracing_subscriber::registry()
            .with(env_filter)
            .with(compact_layer)
            .with(json_layer)
            .with(otel_layer)
            .try_init()
            .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

        tracing::info!(
            service = %config.log.service_name,
            exporting = provider.is_some(),
            "observability initialized"
        );

        Ok(Self {
            service_name: config.log.service_name,
            provider,
            propagator: TracePropagator::new(),
        })
    }

    /// A handle that exports nothing and installs no subscriber.
    pub fn disabled(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            provider: None,
            propagator: TracePropagator::new(),
        }
    }

    /// Propagator to hand to producers, publishers and workers.
    pub fn propagator(&self) -> TracePropagator {
        self.propagator.clone()
    }

    /// Whether spans are exported to an OTLP collector.
    pub fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Flush queued spans and shut the provider down.
    pub fn shutdown(self) -> Result<(), TelemetryError> {
        if let Some(provider) = self.provider {
            provider
                .shutdown()
                .map_err(|e| TelemetryError::Shutdown(e.to_string()))?;
            tracing::debug!(service = %self.service_name, "tracer provider shut down");
        }
        Ok(())
    }
}

fn build_provider(log: &LogConfig, endpoint: &str) -> Result<SdkTracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let processor = BatchSpanProcessor::builder(exporter, runtime::Tokio).build();

    let resource = Resource::builder()
        .with_service_name(log.service_name.clone())
        .with_attribute(KeyValue::new(
            "deployment.environment",
            log.environment.clone(),
        ))
        .build();

    Ok(SdkTracerProvider::builder()
        .with_span_processor(processor)
        .with_resource(resource)
        .build())
}
