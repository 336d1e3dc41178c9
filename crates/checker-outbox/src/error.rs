//! Outbox error types.

use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Store unreachable or constraint violated
    #[error("Persistence error: {0}")]
    Persistence(#[from] checker_database::DatabaseError),

    /// Broker error
    #[error("Broker error: {0}")]
    Broker(#[from] stream_courier::CourierError),

    /// Stored payload is not a valid envelope
    #[error("Invalid envelope in outbox record {record_id}: {reason}")]
    Envelope { record_id: i64, reason: String },

    /// Rejected input, nothing was written
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
