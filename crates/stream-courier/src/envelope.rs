//! Wire-format wrapper placed on the broker.
//!
//! ```json
//! {
//!   "id": "1718000000000-0",
//!   "type": "prime_check",
//!   "payload": {"request_id": 1, "user_id": 7, "number_text": "17"},
//!   "created_at": "2026-10-19T10:00:00Z",
//!   "trace_context": {"traceparent": "00-...-...-01"}
//! }
//! ```
//!
//! `payload` is embedded JSON whose schema is selected by `type`.
//! `trace_context` is omitted when empty. `id` is empty until the broker
//! assigns one.

use crate::{CourierError, CourierResult, TraceContext};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;

const PRIME_CHECK: &str = "prime_check";
const EMAIL_SEND: &str = "email_send";

/// Envelope type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    PrimeCheck,
    EmailSend,
    /// Any tag this build does not know. Kept verbatim.
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::PrimeCheck => PRIME_CHECK,
            Self::EmailSend => EMAIL_SEND,
            Self::Unknown(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            PRIME_CHECK => Self::PrimeCheck,
            EMAIL_SEND => Self::EmailSend,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Topic this type is published to. Unrecognized tags go to the
    /// `unknown` sink topic.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::PrimeCheck => "primecheck",
            Self::EmailSend => "emailsend",
            Self::Unknown(_) => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::parse(&tag))
    }
}

/// Request to check whether `number_text` is prime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrimeCheckPayload {
    /// ID of the originating `prime_checks` row.
    pub request_id: i64,
    pub user_id: i64,
    pub number_text: String,
}

/// Request to email a prime check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailSendPayload {
    pub request_id: i64,
    pub user_id: i64,
    pub email: String,
    pub subject: String,
    pub body: String,
    pub is_prime: bool,
    pub number_text: String,
    /// Broker id of the prime check message that produced this result.
    pub message_id: String,
}

/// Message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Broker-assigned ID, for idempotency and log correlation.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: Box<RawValue>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "TraceContext::is_empty")]
    pub trace_context: TraceContext,
}

impl Envelope {
    /// Wrap a typed payload.
    pub fn new<P: Serialize>(
        message_type: MessageType,
        payload: &P,
        trace_context: TraceContext,
    ) -> CourierResult<Self> {
        Ok(Self {
            id: String::new(),
            message_type,
            payload: serde_json::value::to_raw_value(payload)?,
            created_at: Utc::now(),
            trace_context,
        })
    }

    /// Set the broker-assigned ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Decode the payload as `P`.
    ///
    /// A shape mismatch is reported as [`CourierError::UnknownPayload`] so
    /// handlers can treat it as permanent.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> CourierResult<P> {
        serde_json::from_str(self.payload.get()).map_err(|e| CourierError::UnknownPayload {
            message_type: self.message_type.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_bytes(&self) -> CourierResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CourierResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Topic this envelope is routed to.
    pub fn topic(&self) -> &'static str {
        self.message_type.topic()
    }
}
