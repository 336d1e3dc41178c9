//! Durable subscription loop.
//!
//! A [`Subscriber`] pulls deliveries for one topic and hands each decoded
//! [`Envelope`] to a [`MessageHandler`], one at a time. The handler's
//! outcome decides the acknowledgement:
//!
//! | Outcome                          | Action |
//! |----------------------------------|--------|
//! | `Ok(())`                         | ACK    |
//! | `Err(HandlerError::Retry)`       | NAK    |
//! | `Err(HandlerError::Permanent)`   | ACK (poison) |
//! | undecodable bytes                | ACK (poison) |
//! | delivered more than `max_deliveries` times | ACK (poison) |
//!
//! Poison messages are logged at error level and dropped so they cannot
//! block the topic.

use crate::{BrokerGateway, CourierResult, Delivery, Envelope};
use async_trait::async_trait;
use checker_config_and_utils::ShutdownSignal;
use observability::TracePropagator;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Handler failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient; the message is redelivered after backoff.
    #[error("retryable: {0}")]
    Retry(String),

    /// The message can never succeed; it is acknowledged and dropped.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Processes one envelope.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;
}

/// Subscription tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Deliveries requested per pull.
    pub batch_size: usize,
    /// Longest a pull blocks when nothing is ready.
    pub max_wait: Duration,
    /// Deliveries after which a message is treated as poison.
    pub max_deliveries: u32,
    /// Pause after a failed pull.
    pub error_backoff: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            max_wait: Duration::from_secs(1),
            max_deliveries: 10,
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Counters for one subscription run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub acked: u64,
    pub nacked: u64,
    pub poisoned: u64,
    pub pull_errors: u64,
}

/// Why [`Subscriber::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionExit {
    /// The shutdown signal fired.
    Cancelled(SubscriptionStats),
}

/// Consume `topic` with `handler` until `signal` fires.
pub async fn run_subscription<B, H>(
    broker: Arc<B>,
    topic: &str,
    handler: Arc<H>,
    options: SubscribeOptions,
    signal: ShutdownSignal,
) -> CourierResult<SubscriptionExit>
where
    B: BrokerGateway + ?Sized,
    H: MessageHandler + ?Sized,
{
    Subscriber::new(broker, handler, TracePropagator::new())
        .with_options(options)
        .run(topic, signal)
        .await
}

/// Pulls one topic and dispatches to a handler.
pub struct Subscriber<B: ?Sized, H: ?Sized> {
    broker: Arc<B>,
    handler: Arc<H>,
    options: SubscribeOptions,
    propagator: TracePropagator,
}

impl<B, H> Subscriber<B, H>
where
    B: BrokerGateway + ?Sized,
    H: MessageHandler + ?Sized,
{
    pub fn new(broker: Arc<B>, handler: Arc<H>, propagator: TracePropagator) -> Self {
        Self {
            broker,
            handler,
            options: SubscribeOptions::default(),
            propagator,
        }
    }

    pub fn with_options(mut self, options: SubscribeOptions) -> Self {
        self.options = SubscribeOptions {
            batch_size: options.batch_size.max(1),
            max_deliveries: options.max_deliveries.max(1),
            ..options
        };
        self
    }

    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    /// Consume `topic` until `signal` fires.
    ///
    /// Fails only if the topic cannot be set up. Pull failures after that
    /// are logged and retried after `error_backoff`.
    pub async fn run(
        &self,
        topic: &str,
        mut signal: ShutdownSignal,
    ) -> CourierResult<SubscriptionExit> {
        self.broker.ensure_topic(topic).await?;
        info!(
            topic = %topic,
            batch_size = self.options.batch_size,
            max_deliveries = self.options.max_deliveries,
            "Subscription started"
        );

        let mut stats = SubscriptionStats::default();

        'outer: loop {
            if signal.is_cancelled() {
                break;
            }

            let pulled = tokio::select! {
                _ = signal.cancelled() => break,
                pulled = self.broker.pull(topic, self.options.batch_size, self.options.max_wait) => pulled,
            };

            let deliveries = match pulled {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    stats.pull_errors += 1;
                    warn!(topic = %topic, error = %e, "Pull failed, backing off");
                    tokio::select! {
                        _ = signal.cancelled() => break,
                        _ = tokio::time::sleep(self.options.error_backoff) => {}
                    }
                    continue;
                }
            };

            for delivery in deliveries {
                if signal.is_cancelled() {
                    // Undelivered rest of the batch stays pending for redelivery
                    break 'outer;
                }
                self.process(delivery, &mut stats).await;
            }
        }

        if let Err(e) = self.broker.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "Unsubscribe failed");
        }
        info!(
            topic = %topic,
            acked = stats.acked,
            nacked = stats.nacked,
            poisoned = stats.poisoned,
            pull_errors = stats.pull_errors,
            "Subscription stopped"
        );
        Ok(SubscriptionExit::Cancelled(stats))
    }

    async fn process(&self, delivery: Delivery, stats: &mut SubscriptionStats) {
        if delivery.delivery_count > self.options.max_deliveries {
            error!(
                topic = %delivery.topic,
                message_id = %delivery.broker_id,
                deliveries = delivery.delivery_count,
                "Delivery limit exceeded, dropping poison message"
            );
            self.poison(&delivery, stats).await;
            return;
        }

        let envelope = match Envelope::from_bytes(&delivery.data) {
            Ok(envelope) => envelope.with_id(delivery.broker_id.clone()),
            Err(e) => {
                error!(
                    topic = %delivery.topic,
                    message_id = %delivery.broker_id,
                    error = %e,
                    "Undecodable message, dropping"
                );
                self.poison(&delivery, stats).await;
                return;
            }
        };

        let span = info_span!(
            "consume_message",
            topic = %delivery.topic,
            message_id = %delivery.broker_id,
            message_type = %envelope.message_type,
            delivery = delivery.delivery_count,
        );
        self.propagator.link_span(&span, &envelope.trace_context);

        match self.handler.handle(envelope).instrument(span).await {
            Ok(()) => {
                debug!(message_id = %delivery.broker_id, "Handled");
                match self.broker.ack(&delivery).await {
                    Ok(()) => stats.acked += 1,
                    Err(e) => warn!(message_id = %delivery.broker_id, error = %e, "Ack failed"),
                }
            }
            Err(HandlerError::Permanent(reason)) => {
                error!(
                    topic = %delivery.topic,
                    message_id = %delivery.broker_id,
                    reason = %reason,
                    "Permanent handler failure, dropping"
                );
                self.poison(&delivery, stats).await;
            }
            Err(HandlerError::Retry(reason)) => {
                warn!(
                    topic = %delivery.topic,
                    message_id = %delivery.broker_id,
                    deliveries = delivery.delivery_count,
                    reason = %reason,
                    "Handler failed, requesting redelivery"
                );
                match self.broker.nak(&delivery).await {
                    Ok(()) => stats.nacked += 1,
                    Err(e) => warn!(message_id = %delivery.broker_id, error = %e, "Nak failed"),
                }
            }
        }
    }

    async fn poison(&self, delivery: &Delivery, stats: &mut SubscriptionStats) {
        match self.broker.ack(delivery).await {
            Ok(()) => stats.poisoned += 1,
            Err(e) => warn!(message_id = %delivery.broker_id, error = %e, "Ack of poison message failed"),
        }
    }
}
