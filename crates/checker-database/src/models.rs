//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A primality check request and, once processed, its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeCheck {
    pub id: i64,
    pub user_id: i64,
    pub number_text: String,
    pub status: PrimeCheckStatus,
    pub is_prime: Option<bool>,
    /// Trace id of the request that created the row.
    pub trace_id: Option<String>,
    /// Broker id of the message that completed the row.
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Prime check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimeCheckStatus {
    Pending,
    Completed,
    Failed,
}

impl Default for PrimeCheckStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl PrimeCheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// New prime check for insertion.
#[derive(Debug, Clone)]
pub struct NewPrimeCheck {
    pub user_id: i64,
    pub number_text: String,
    pub trace_id: Option<String>,
}

/// Terminal result written back by the prime-check worker.
#[derive(Debug, Clone)]
pub struct PrimeCheckResolution {
    pub id: i64,
    pub status: PrimeCheckStatus,
    pub is_prime: Option<bool>,
    pub message_id: Option<String>,
    pub trace_id: Option<String>,
}

/// One intended-but-not-yet-delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Monotonic, assigned by SQLite.
    pub id: i64,
    /// Discriminates the payload schema.
    pub event_type: String,
    /// Serialized envelope.
    pub payload: Vec<u8>,
    /// Set once the broker confirmed the publish. Never reverts.
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
