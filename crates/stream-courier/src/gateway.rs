//! Broker gateway capability.

use crate::{CourierResult, Envelope};
use async_trait::async_trait;
use std::time::Duration;

/// A message handed to a subscriber, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    /// Broker message ID (e.g., "1718000000000-0").
    pub broker_id: String,
    /// Raw envelope bytes as stored on the stream.
    pub data: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

/// Durable pull-based publish/subscribe transport.
///
/// Implementations must be safe for concurrent `publish` calls from one
/// shared handle.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Idempotently create the persistent stream and durable consumer group
    /// for `topic`.
    async fn ensure_topic(&self, topic: &str) -> CourierResult<()>;

    /// Durably append `envelope` to `topic`. Returns the broker-assigned ID.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> CourierResult<String>;

    /// Fetch up to `max_messages`, waiting at most `wait` when none are
    /// ready. An empty batch is not an error.
    async fn pull(
        &self,
        topic: &str,
        max_messages: usize,
        wait: Duration,
    ) -> CourierResult<Vec<Delivery>>;

    /// Remove a delivery from the pending set.
    async fn ack(&self, delivery: &Delivery) -> CourierResult<()>;

    /// Reject a delivery so it is redelivered after backoff.
    async fn nak(&self, delivery: &Delivery) -> CourierResult<()>;

    /// Stop consuming `topic`. Pending deliveries stay with the group.
    async fn unsubscribe(&self, topic: &str) -> CourierResult<()>;

    /// Release the connection. Later calls fail with `BrokerUnavailable`.
    async fn close(&self) -> CourierResult<()>;
}

/// Exponential redelivery backoff.
///
/// Delay before the next attempt is `base * 2^(deliveries - 1)`, capped at
/// `max`. With base 1s and max 60s:
/// - after 1st delivery: 1s
/// - after 2nd delivery: 2s
/// - after 3rd delivery: 4s
/// - ... up to 60s
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl RedeliveryPolicy {
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            backoff_base,
            backoff_max,
        }
    }

    /// No delay; rejected messages are ready again on the next pull.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay before redelivering a message delivered `deliveries` times.
    pub fn delay_for(&self, deliveries: u32) -> Duration {
        let exponent = deliveries.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}
