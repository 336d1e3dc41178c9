//! Logging and tracing initialization for the prime checker services.
//!
//! Thin wrappers over the observability crate: every service builds its
//! [`observability::Telemetry`] handle from the shared [`Config`].

use crate::{Config, CoreResult};
use observability::{LogConfig, LogFormat, Telemetry, TelemetryConfig};

/// Build the telemetry configuration for `service_name`.
///
/// `PRIME_CHECKER_LOG_FORMAT=json` switches stderr output to JSON lines.
pub fn telemetry_config(service_name: &str, config: &Config) -> TelemetryConfig {
    let format = match std::env::var("PRIME_CHECKER_LOG_FORMAT")
        .unwrap_or_default()
        .to_ascii_lowercase()
        .as_str()
    {
        "json" => LogFormat::Json,
        _ => LogFormat::Compact,
    };

    TelemetryConfig {
        log: LogConfig {
            service_name: service_name.to_string(),
            default_level: config.log_level.clone(),
            format,
            environment: config.environment.clone(),
        },
        otlp_endpoint: config.otlp_endpoint.clone(),
    }
}

/// Initialize logging and tracing for a service.
///
/// # Example
///
/// ```ignore
/// let telemetry = init_telemetry("prime-worker", &config)?;
/// tracing::info!("worker started");
/// // ...
/// telemetry.shutdown()?;
/// ```
pub fn init_telemetry(service_name: &str, config: &Config) -> CoreResult<Telemetry> {
    Ok(Telemetry::init(telemetry_config(service_name, config))?)
}
