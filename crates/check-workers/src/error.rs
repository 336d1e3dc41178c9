//! Worker error types.

use stream_courier::HandlerError;
use thiserror::Error;

/// Worker error type.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Payload does not match the envelope's declared type
    #[error("Unknown payload: {0}")]
    UnknownPayload(String),

    /// The number cannot be checked
    #[error("Invalid number {number_text:?}: {reason}")]
    InvalidNumber { number_text: String, reason: String },

    /// The domain action (check, send) failed
    #[error("Domain action failed: {0}")]
    DomainAction(String),

    /// The originating row is gone
    #[error("Prime check {0} not found")]
    NotFound(i64),

    /// Database error
    #[error("Persistence error: {0}")]
    Persistence(#[from] checker_database::DatabaseError),

    /// Outbox error
    #[error("Outbox error: {0}")]
    Outbox(#[from] checker_outbox::OutboxError),
}

impl WorkerError {
    /// Whether redelivery could ever help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::UnknownPayload(_) | Self::InvalidNumber { .. } | Self::NotFound(_)
        )
    }
}

impl From<stream_courier::CourierError> for WorkerError {
    fn from(e: stream_courier::CourierError) -> Self {
        if matches!(e, stream_courier::CourierError::UnknownPayload { .. }) {
            Self::UnknownPayload(e.to_string())
        } else {
            Self::DomainAction(e.to_string())
        }
    }
}

impl From<WorkerError> for HandlerError {
    fn from(e: WorkerError) -> Self {
        if e.is_permanent() {
            HandlerError::Permanent(e.to_string())
        } else {
            HandlerError::Retry(e.to_string())
        }
    }
}

/// Result type alias using WorkerError.
pub type WorkerResult<T> = Result<T, WorkerError>;
