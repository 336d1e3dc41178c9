//! Core error types.

use thiserror::Error;

/// Core error type for configuration and startup.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Telemetry could not be initialized
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] observability::TelemetryError),
}

/// Result type alias using CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
