//! # Observability
//!
//! Logging, tracing and trace-context propagation for the prime checker
//! services.
//!
//! ## Design Philosophy
//!
//! Services are **log producers**. They build one [`Telemetry`] handle at
//! startup, use standard `tracing` macros throughout their code, and call
//! [`Telemetry::shutdown`] before exiting. Nothing here registers a
//! process-global tracer provider: the handle owns the provider and hands
//! out a [`TracePropagator`] that callers pass down explicitly.
//!
//! ## Trace propagation
//!
//! Messages cross process boundaries through the outbox and the broker. The
//! producer injects the current span context into a string-keyed map that
//! travels inside the message envelope, and the consumer extracts it again
//! so its spans attach to the originating request.
//!
//! ## Usage
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() {
//!     let telemetry = observability::Telemetry::init(observability::TelemetryConfig {
//!         log: observability::LogConfig {
//!             service_name: "outbox-publisher".into(),
//!             default_level: "debug".into(),
//!             ..Default::default()
//!         },
//!         otlp_endpoint: Some("http://localhost:4318/v1/traces".into()),
//!     })
//!     .expect("telemetry");
//!
//!     let propagator = telemetry.propagator();
//!     // ... pass `propagator` to producers and workers
//!
//!     telemetry.shutdown().ok();
//! }
//! ```

mod propagation;
mod telemetry;

pub use propagation::{TraceContext, TracePropagator, TRACEPARENT_HEADER};
pub use telemetry::{Telemetry, TelemetryConfig, TelemetryError};

/// Output format for log lines written to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// OpenTelemetry service name and tracer name, e.g. "prime-worker".
    pub service_name: String,

    /// Filter used when `RUST_LOG` is unset.
    pub default_level: String,

    /// Line format for stderr output.
    pub format: LogFormat,

    /// Logical environment name attached to exported spans.
    pub environment: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            format: LogFormat::Compact,
            environment: "development".into(),
        }
    }
}
