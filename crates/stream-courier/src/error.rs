//! Error types for the stream courier.

use thiserror::Error;

/// Courier error type.
#[derive(Error, Debug)]
pub enum CourierError {
    /// The transport cannot be reached (connection refused, dropped, timed
    /// out, or the gateway was closed).
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker rejected a publish.
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Envelope could not be serialized or parsed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload shape does not match the envelope's declared type.
    #[error("Payload does not match type {message_type}: {reason}")]
    UnknownPayload {
        message_type: String,
        reason: String,
    },

    /// Redis replied with an error that is not a transport failure
    #[error("Redis error: {0}")]
    Redis(redis::RedisError),

    /// Unexpected reply shape
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Topic name cannot be used as a stream key
    #[error("Invalid topic name: {0:?}")]
    InvalidTopic(String),
}

impl CourierError {
    /// Whether the failure is the transport being down rather than the
    /// request being rejected.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_))
    }
}

impl From<redis::RedisError> for CourierError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_connection_refusal()
            || e.is_connection_dropped()
            || e.is_timeout()
        {
            Self::BrokerUnavailable(e.to_string())
        } else {
            Self::Redis(e)
        }
    }
}

/// Result type for courier operations.
pub type CourierResult<T> = Result<T, CourierError>;
