//! In-memory [`BrokerGateway`] for tests.
//!
//! Models one consumer group per topic: an append-only entry log, a read
//! cursor, and a pending map of delivered-but-unacknowledged entries. A NAK
//! schedules the entry for redelivery after the configured backoff.
//!
//! Failure injection:
//! - [`InMemoryBroker::fail_next_publishes`] rejects the next N publishes
//! - [`InMemoryBroker::fail_publishes_when`] rejects matching envelopes
//! - [`InMemoryBroker::set_unavailable`] makes every call fail with
//!   `BrokerUnavailable`

use crate::topic::validate_topic;
use crate::{BrokerGateway, CourierError, CourierResult, Delivery, Envelope, RedeliveryPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

type PublishPredicate = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredEntry {
    seq: u64,
    id: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    data: Vec<u8>,
    delivery_count: u32,
    /// `None` while in flight; `Some(t)` once rejected, redeliverable at `t`.
    redeliver_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct TopicLog {
    entries: Vec<StoredEntry>,
    cursor: usize,
    /// Keyed by sequence number so redelivery follows publish order.
    pending: BTreeMap<u64, (String, PendingEntry)>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    next_seq: u64,
    publish_failures_remaining: u32,
    publish_predicate: Option<PublishPredicate>,
    unavailable: bool,
    closed: bool,
    published: Vec<(String, Envelope)>,
    acked: Vec<String>,
    nacked: Vec<String>,
    unsubscribed: Vec<String>,
}

/// In-memory broker with failure injection and inspection helpers.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    redelivery: RedeliveryPolicy,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// A broker that redelivers NAKed messages on the next pull.
    pub fn new() -> Self {
        Self::with_redelivery(RedeliveryPolicy::immediate())
    }

    pub fn with_redelivery(redelivery: RedeliveryPolicy) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            redelivery,
        }
    }

    /// Reject the next `count` publishes with a publish error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().publish_failures_remaining = count;
    }

    /// Reject every publish whose envelope matches `predicate`.
    pub fn fail_publishes_when<F>(&self, predicate: F)
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        self.state.lock().publish_predicate = Some(Box::new(predicate));
    }

    pub fn clear_publish_failures(&self) {
        let mut state = self.state.lock();
        state.publish_failures_remaining = 0;
        state.publish_predicate = None;
    }

    /// Simulate the transport going down or coming back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Append raw bytes, bypassing envelope serialization. For poison tests.
    pub fn publish_raw(&self, topic: &str, data: Vec<u8>) -> String {
        let id = {
            let mut state = self.state.lock();
            Self::append(&mut state, topic, data)
        };
        self.notify.notify_waiters();
        id
    }

    /// Envelopes successfully published to `topic`, in order.
    pub fn published(&self, topic: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    pub fn published_count(&self) -> usize {
        self.state.lock().published.len()
    }

    /// Ordered list of acknowledged message IDs.
    pub fn ack_log(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    pub fn ack_count(&self) -> usize {
        self.state.lock().acked.len()
    }

    /// Ordered list of negatively acknowledged message IDs.
    pub fn nak_log(&self) -> Vec<String> {
        self.state.lock().nacked.clone()
    }

    pub fn nak_count(&self) -> usize {
        self.state.lock().nacked.len()
    }

    /// Delivered but unacknowledged messages on `topic`.
    pub fn pending_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.pending.len())
            .unwrap_or(0)
    }

    /// Messages on `topic` never delivered.
    pub fn undelivered_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|log| log.entries.len() - log.cursor)
            .unwrap_or(0)
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    pub fn unsubscribed_topics(&self) -> Vec<String> {
        self.state.lock().unsubscribed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn check_available(state: &BrokerState) -> CourierResult<()> {
        if state.closed {
            return Err(CourierError::BrokerUnavailable("gateway closed".to_string()));
        }
        if state.unavailable {
            return Err(CourierError::BrokerUnavailable(
                "in-memory broker marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn append(state: &mut BrokerState, topic: &str, data: Vec<u8>) -> String {
        state.next_seq += 1;
        let seq = state.next_seq;
        let id = format!("{}-0", seq);
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .entries
            .push(StoredEntry {
                seq,
                id: id.clone(),
                data,
            });
        id
    }

    /// Collect ready deliveries: due redeliveries first, then new entries.
    fn take_ready(&self, topic: &str, max_messages: usize) -> CourierResult<Vec<Delivery>> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        let now = Instant::now();
        let log = state.topics.entry(topic.to_string()).or_default();
        let mut batch = Vec::new();

        for (id, pending) in log.pending.values_mut() {
            if batch.len() >= max_messages {
                break;
            }
            if matches!(pending.redeliver_at, Some(at) if at <= now) {
                pending.redeliver_at = None;
                pending.delivery_count += 1;
                batch.push(Delivery {
                    topic: topic.to_string(),
                    broker_id: id.clone(),
                    data: pending.data.clone(),
                    delivery_count: pending.delivery_count,
                });
            }
        }

        while batch.len() < max_messages && log.cursor < log.entries.len() {
            let entry = log.entries[log.cursor].clone();
            log.cursor += 1;
            log.pending.insert(
                entry.seq,
                (
                    entry.id.clone(),
                    PendingEntry {
                        data: entry.data.clone(),
                        delivery_count: 1,
                        redeliver_at: None,
                    },
                ),
            );
            batch.push(Delivery {
                topic: topic.to_string(),
                broker_id: entry.id,
                data: entry.data,
                delivery_count: 1,
            });
        }

        Ok(batch)
    }

    fn next_redelivery(&self, topic: &str) -> Option<Instant> {
        self.state
            .lock()
            .topics
            .get(topic)?
            .pending
            .values()
            .filter_map(|(_, pending)| pending.redeliver_at)
            .min()
    }
}

#[async_trait]
impl BrokerGateway for InMemoryBroker {
    async fn ensure_topic(&self, topic: &str) -> CourierResult<()> {
        validate_topic(topic)?;
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.topics.entry(topic.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> CourierResult<String> {
        validate_topic(topic)?;
        let data = envelope.to_bytes()?;
        let id = {
            let mut state = self.state.lock();
            Self::check_available(&state)?;

            if state.publish_failures_remaining > 0 {
                state.publish_failures_remaining -= 1;
                return Err(CourierError::Publish("injected publish failure".to_string()));
            }
            if state
                .publish_predicate
                .as_ref()
                .is_some_and(|predicate| predicate(envelope))
            {
                return Err(CourierError::Publish("publish rejected by predicate".to_string()));
            }

            let id = Self::append(&mut state, topic, data);
            state
                .published
                .push((topic.to_string(), envelope.clone().with_id(id.clone())));
            id
        };

        debug!(topic = %topic, message_id = %id, "Published envelope (in-memory)");
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn pull(
        &self,
        topic: &str,
        max_messages: usize,
        wait: Duration,
    ) -> CourierResult<Vec<Delivery>> {
        let max_messages = max_messages.max(1);
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a publish in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_ready(topic, max_messages)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake_at = self
                .next_redelivery(topic)
                .map(|due| due.min(deadline))
                .unwrap_or(deadline);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> CourierResult<()> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;

        let removed = state.topics.get_mut(&delivery.topic).and_then(|log| {
            let seq = log
                .pending
                .iter()
                .find(|(_, (id, _))| *id == delivery.broker_id)
                .map(|(seq, _)| *seq)?;
            log.pending.remove(&seq)
        });

        if removed.is_some() {
            state.acked.push(delivery.broker_id.clone());
        }
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery) -> CourierResult<()> {
        let redeliver_at = Instant::now() + self.redelivery.delay_for(delivery.delivery_count);
        {
            let mut state = self.state.lock();
            Self::check_available(&state)?;

            if let Some(log) = state.topics.get_mut(&delivery.topic) {
                if let Some((_, pending)) = log
                    .pending
                    .values_mut()
                    .find(|(id, _)| *id == delivery.broker_id)
                {
                    pending.redeliver_at = Some(redeliver_at);
                }
            }
            state.nacked.push(delivery.broker_id.clone());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> CourierResult<()> {
        self.state.lock().unsubscribed.push(topic.to_string());
        Ok(())
    }

    async fn close(&self) -> CourierResult<()> {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}
