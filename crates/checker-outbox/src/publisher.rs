//! Outbox publisher.
//!
//! Timer-driven poller that moves unprocessed outbox records onto the
//! broker.
//!
//! ```text
//! IDLE --tick--> DRAINING --done--> IDLE
//!                   |
//!                   +--cancelled--> STOPPED
//! ```
//!
//! Per tick, records are attempted in ascending ID order. Each record is
//! published and then marked processed. A record whose publish or mark
//! fails stays unprocessed and becomes eligible again on the next tick; it
//! never blocks the records after it. Only a failed store read aborts a
//! tick.
//!
//! A record whose payload is not an envelope is quarantined: its raw bytes
//! are wrapped in an [`UndecodableRecord`] and published to the `unknown`
//! topic, then the record is marked processed like any other.

use crate::{OutboxError, OutboxResult, OutboxStore};
use checker_config_and_utils::ShutdownSignal;
use checker_database::OutboxRecord;
use observability::TracePropagator;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use stream_courier::{BrokerGateway, Envelope, MessageType, TraceContext};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const MIN_PUBLISH_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_PUBLISH_INTERVAL: Duration = Duration::from_secs(300);

/// Message type of quarantined records.
pub const UNDECODABLE_RECORD_TYPE: &str = "undecodable_outbox_record";

/// Payload carrying an outbox record that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndecodableRecord {
    pub record_id: i64,
    pub event_type: String,
    pub reason: String,
    /// Original payload, lossily decoded as UTF-8.
    pub raw: String,
}

/// Publisher configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Time between ticks. Clamped to
    /// [`MIN_PUBLISH_INTERVAL`]..=[`MAX_PUBLISH_INTERVAL`].
    pub interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

impl PublisherConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.clamp(MIN_PUBLISH_INTERVAL, MAX_PUBLISH_INTERVAL),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Idle,
    Draining,
    Stopped,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

/// What happened to one record during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicationOutcome {
    /// Published and marked processed. Carries the broker message ID.
    Published(String),
    /// Broker rejected or could not be reached.
    PublishFailed(String),
    /// Published, but the processed flag could not be set. The record
    /// will be published again.
    MarkFailed(String),
    /// Payload was not a decodable envelope. It went to the `unknown` topic
    /// under the carried message ID and the record was marked processed.
    Quarantined(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationResult {
    pub record_id: i64,
    pub event_type: String,
    pub topic: String,
    pub outcome: PublicationOutcome,
}

impl PublicationResult {
    pub fn is_published(&self) -> bool {
        matches!(self.outcome, PublicationOutcome::Published(_))
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub results: Vec<PublicationResult>,
    /// The signal fired before every record was attempted.
    pub interrupted: bool,
}

impl TickReport {
    pub fn published(&self) -> usize {
        self.results.iter().filter(|r| r.is_published()).count()
    }

    pub fn quarantined(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, PublicationOutcome::Quarantined(_)))
            .count()
    }

    /// Records left unprocessed by this tick.
    pub fn failed(&self) -> usize {
        self.results.len() - self.published() - self.quarantined()
    }
}

/// Why [`OutboxPublisher::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherExit {
    Stopped,
}

/// Polls an [`OutboxStore`] and publishes to a [`BrokerGateway`].
pub struct OutboxPublisher<S: ?Sized, B: ?Sized> {
    store: Arc<S>,
    broker: Arc<B>,
    config: PublisherConfig,
    propagator: TracePropagator,
}

impl<S, B> OutboxPublisher<S, B>
where
    S: OutboxStore + ?Sized,
    B: BrokerGateway + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        broker: Arc<B>,
        config: PublisherConfig,
        propagator: TracePropagator,
    ) -> Self {
        Self {
            store,
            broker,
            config: PublisherConfig::new(config.interval),
            propagator,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Run ticks until `signal` fires.
    pub async fn run(&self, mut signal: ShutdownSignal) -> PublisherExit {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.config.interval.as_millis() as u64, "Outbox publisher started");

        let mut state = PublisherState::Idle;
        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                _ = interval.tick() => {}
            }

            state = transition(state, PublisherState::Draining);
            match self.publish_pending(&signal).await {
                Ok(report) => {
                    if !report.results.is_empty() {
                        info!(
                            published = report.published(),
                            quarantined = report.quarantined(),
                            failed = report.failed(),
                            "Outbox tick complete"
                        );
                    }
                    if report.interrupted {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "Outbox tick aborted"),
            }
            state = transition(state, PublisherState::Idle);
        }

        transition(state, PublisherState::Stopped);
        info!("Outbox publisher stopped");
        PublisherExit::Stopped
    }

    /// One tick: attempt every unprocessed record once, in ID order.
    ///
    /// Returns `Err` only if the store cannot be read.
    pub async fn publish_pending(&self, signal: &ShutdownSignal) -> OutboxResult<TickReport> {
        let records = self.store.list_unprocessed().await?;
        if !records.is_empty() {
            debug!(count = records.len(), "Draining outbox");
        }

        let mut report = TickReport::default();
        for record in records {
            if signal.is_cancelled() {
                report.interrupted = true;
                break;
            }
            report.results.push(self.publish_record(record).await);
        }
        Ok(report)
    }

    async fn publish_record(&self, record: OutboxRecord) -> PublicationResult {
        let (topic, outcome) = match Envelope::from_bytes(&record.payload) {
            Ok(envelope) => {
                let topic = MessageType::parse(&record.event_type).topic();
                (topic, self.attempt(&record, topic, &envelope).await)
            }
            Err(e) => {
                let err = OutboxError::Envelope {
                    record_id: record.id,
                    reason: e.to_string(),
                };
                self.quarantine(&record, err).await
            }
        };
        PublicationResult {
            record_id: record.id,
            event_type: record.event_type,
            topic: topic.to_string(),
            outcome,
        }
    }

    /// Route an undecodable record to the `unknown` topic.
    async fn quarantine(
        &self,
        record: &OutboxRecord,
        err: OutboxError,
    ) -> (&'static str, PublicationOutcome) {
        let message_type = MessageType::Unknown(UNDECODABLE_RECORD_TYPE.to_string());
        let topic = message_type.topic();
        let payload = UndecodableRecord {
            record_id: record.id,
            event_type: record.event_type.clone(),
            reason: err.to_string(),
            raw: String::from_utf8_lossy(&record.payload).into_owned(),
        };
        let envelope = match Envelope::new(message_type, &payload, TraceContext::new()) {
            Ok(envelope) => envelope,
            Err(e) => return (topic, PublicationOutcome::PublishFailed(e.to_string())),
        };

        error!(record_id = record.id, error = %err, "Quarantining undecodable outbox record");
        let outcome = match self.attempt(record, topic, &envelope).await {
            PublicationOutcome::Published(message_id) => {
                PublicationOutcome::Quarantined(message_id)
            }
            other => other,
        };
        (topic, outcome)
    }

    async fn attempt(
        &self,
        record: &OutboxRecord,
        topic: &str,
        envelope: &Envelope,
    ) -> PublicationOutcome {
        let span = info_span!(
            "publish_outbox_record",
            record_id = record.id,
            event_type = %record.event_type,
            topic = %topic,
        );
        self.propagator.link_span(&span, &envelope.trace_context);

        async {
            let message_id = match self.broker.publish(topic, envelope).await {
                Ok(message_id) => message_id,
                Err(e) => {
                    warn!(
                        record_id = record.id,
                        unavailable = e.is_unavailable(),
                        error = %e,
                        "Publish failed, record stays unprocessed"
                    );
                    return PublicationOutcome::PublishFailed(e.to_string());
                }
            };

            match self.store.mark_processed(record.id).await {
                Ok(flipped) => {
                    debug!(record_id = record.id, message_id = %message_id, flipped, "Published");
                    PublicationOutcome::Published(message_id)
                }
                Err(e) => {
                    error!(
                        record_id = record.id,
                        message_id = %message_id,
                        error = %e,
                        "Published but could not mark processed; will republish"
                    );
                    PublicationOutcome::MarkFailed(e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn transition(from: PublisherState, to: PublisherState) -> PublisherState {
    if from != to {
        debug!(from = %from, to = %to, "Publisher state");
    }
    to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryOutboxStore, SqliteOutboxStore};
    use checker_config_and_utils::Shutdown;
    use checker_database::{queries, AsyncDatabase};
    use stream_courier::{InMemoryBroker, PrimeCheckPayload, TraceContext};

    fn envelope(request_id: i64, number: &str) -> Envelope {
        Envelope::new(
            MessageType::PrimeCheck,
            &PrimeCheckPayload {
                request_id,
                user_id: 1,
                number_text: number.to_string(),
            },
            TraceContext::new(),
        )
        .unwrap()
    }

    fn publisher(
        store: Arc<InMemoryOutboxStore>,
        broker: Arc<InMemoryBroker>,
    ) -> OutboxPublisher<InMemoryOutboxStore, InMemoryBroker> {
        OutboxPublisher::new(store, broker, PublisherConfig::default(), TracePropagator::new())
    }

    fn idle_signal() -> (Shutdown, ShutdownSignal) {
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        (shutdown, signal)
    }

    #[test]
    fn test_interval_is_clamped() {
        assert_eq!(PublisherConfig::new(Duration::ZERO).interval, MIN_PUBLISH_INTERVAL);
        assert_eq!(
            PublisherConfig::new(Duration::from_secs(3600)).interval,
            MAX_PUBLISH_INTERVAL
        );
        assert_eq!(
            PublisherConfig::new(Duration::from_secs(5)),
            PublisherConfig::default()
        );
    }

    #[tokio::test]
    async fn test_tick_publishes_and_marks() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let id = store.insert_envelope(&envelope(1, "17")).unwrap();
        let (_shutdown, signal) = idle_signal();

        let report = publisher(store.clone(), broker.clone())
            .publish_pending(&signal)
            .await
            .unwrap();

        assert_eq!(report.published(), 1);
        assert_eq!(report.results[0].topic, "primecheck");
        assert!(store.is_processed(id));
        assert_eq!(broker.published("primecheck").len(), 1);
    }

    #[tokio::test]
    async fn test_publish_failures_retry_on_later_ticks() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let id = store.insert_envelope(&envelope(1, "17")).unwrap();
        let publisher = publisher(store.clone(), broker.clone());
        let (_shutdown, signal) = idle_signal();

        const FAILURES: u32 = 3;
        broker.fail_next_publishes(FAILURES);

        for _ in 0..FAILURES {
            let report = publisher.publish_pending(&signal).await.unwrap();
            // Attempted once per tick, never retried within it
            assert_eq!(report.results.len(), 1);
            assert_eq!(report.failed(), 1);
            assert!(!store.is_processed(id));
        }

        let report = publisher.publish_pending(&signal).await.unwrap();
        assert_eq!(report.published(), 1);
        assert!(store.is_processed(id));
        assert_eq!(broker.published("primecheck").len(), 1);

        // Nothing left to do
        assert!(publisher.publish_pending(&signal).await.unwrap().results.is_empty());
    }

    #[tokio::test]
    async fn test_failing_record_does_not_block_others() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let a = store.insert_envelope(&envelope(1, "13")).unwrap();
        let b = store.insert_envelope(&envelope(2, "17")).unwrap();
        broker.fail_publishes_when(|e| e.payload.get().contains("\"13\""));
        let (_shutdown, signal) = idle_signal();

        let report = publisher(store.clone(), broker.clone())
            .publish_pending(&signal)
            .await
            .unwrap();

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].record_id, a);
        assert!(matches!(report.results[0].outcome, PublicationOutcome::PublishFailed(_)));
        assert!(report.results[1].is_published());
        assert!(!store.is_processed(a));
        assert!(store.is_processed(b));
    }

    #[tokio::test]
    async fn test_mark_failure_republishes_next_tick() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let id = store.insert_envelope(&envelope(1, "17")).unwrap();
        let publisher = publisher(store.clone(), broker.clone());
        let (_shutdown, signal) = idle_signal();

        store.fail_marks_for(id);
        let report = publisher.publish_pending(&signal).await.unwrap();
        assert!(matches!(report.results[0].outcome, PublicationOutcome::MarkFailed(_)));
        assert!(!store.is_processed(id));

        store.clear_mark_failures();
        publisher.publish_pending(&signal).await.unwrap();
        assert!(store.is_processed(id));
        // At-least-once: the record went out twice
        assert_eq!(broker.published("primecheck").len(), 2);
    }

    #[tokio::test]
    async fn test_store_read_failure_aborts_tick() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        store.insert_envelope(&envelope(1, "17")).unwrap();
        store.set_fail_reads(true);
        let (_shutdown, signal) = idle_signal();

        let result = publisher(store, broker.clone()).publish_pending(&signal).await;
        assert!(matches!(result, Err(OutboxError::Persistence(_))));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_event_type_goes_to_unknown_topic() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let raw = br#"{"id":"","type":"sms_send","payload":{},"created_at":"2026-10-19T10:00:00Z"}"#;
        let id = store.insert("sms_send", raw.to_vec());
        let (_shutdown, signal) = idle_signal();

        let report = publisher(store.clone(), broker.clone())
            .publish_pending(&signal)
            .await
            .unwrap();

        assert_eq!(report.results[0].topic, "unknown");
        assert!(store.is_processed(id));
        assert_eq!(broker.published("unknown").len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_quarantined() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let bad = store.insert("prime_check", b"garbage".to_vec());
        let good = store.insert_envelope(&envelope(2, "17")).unwrap();
        let publisher = publisher(store.clone(), broker.clone());
        let (_shutdown, signal) = idle_signal();

        let report = publisher.publish_pending(&signal).await.unwrap();

        assert!(matches!(report.results[0].outcome, PublicationOutcome::Quarantined(_)));
        assert_eq!(report.results[0].topic, "unknown");
        assert_eq!((report.published(), report.quarantined(), report.failed()), (1, 1, 0));
        assert!(store.is_processed(bad));
        assert!(store.is_processed(good));

        let quarantined = broker.published("unknown");
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].message_type.as_str(), UNDECODABLE_RECORD_TYPE);
        let payload: UndecodableRecord = quarantined[0].decode_payload().unwrap();
        assert_eq!(payload.record_id, bad);
        assert_eq!(payload.event_type, "prime_check");
        assert_eq!(payload.raw, "garbage");

        // Contained: the next tick has nothing to retry
        assert!(publisher.publish_pending(&signal).await.unwrap().results.is_empty());
    }

    #[tokio::test]
    async fn test_quarantine_publish_failure_retries() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let bad = store.insert("email_send", vec![0xff, 0xfe]);
        let publisher = publisher(store.clone(), broker.clone());
        let (_shutdown, signal) = idle_signal();

        broker.fail_next_publishes(1);
        let report = publisher.publish_pending(&signal).await.unwrap();
        assert!(matches!(report.results[0].outcome, PublicationOutcome::PublishFailed(_)));
        assert!(!store.is_processed(bad));

        let report = publisher.publish_pending(&signal).await.unwrap();
        assert_eq!(report.quarantined(), 1);
        assert!(store.is_processed(bad));
    }

    #[tokio::test]
    async fn test_cancelled_signal_interrupts_tick() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        store.insert_envelope(&envelope(1, "17")).unwrap();
        let (shutdown, signal) = idle_signal();
        shutdown.trigger();

        let report = publisher(store.clone(), broker.clone())
            .publish_pending(&signal)
            .await
            .unwrap();
        assert!(report.interrupted);
        assert!(report.results.is_empty());
        assert_eq!(store.unprocessed_count(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_then_stops_on_cancel() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let env = envelope(1, "17");
        let id = db
            .transaction(move |tx| crate::append_envelope(tx, &env))
            .await
            .unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = OutboxPublisher::new(
            Arc::new(SqliteOutboxStore::new(db.clone())),
            broker.clone(),
            PublisherConfig::new(MIN_PUBLISH_INTERVAL),
            TracePropagator::new(),
        );

        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let task = tokio::spawn(async move { publisher.run(signal).await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.published_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("record should be published");

        shutdown.trigger();
        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("publisher should stop promptly")
            .unwrap();
        assert_eq!(exit, PublisherExit::Stopped);

        let record = db
            .call(move |conn| queries::get_outbox_record(conn, id))
            .await
            .unwrap()
            .unwrap();
        assert!(record.processed);
    }

    #[tokio::test]
    async fn test_run_survives_unavailable_broker() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let id = store.insert_envelope(&envelope(1, "17")).unwrap();
        broker.set_unavailable(true);

        let publisher = OutboxPublisher::new(
            store.clone(),
            broker.clone(),
            PublisherConfig::new(MIN_PUBLISH_INTERVAL),
            TracePropagator::new(),
        );
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();
        let task = tokio::spawn(async move { publisher.run(signal).await });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!store.is_processed(id));
        broker.set_unavailable(false);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !store.is_processed(id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("record should be published once the broker is back");

        shutdown.trigger();
        assert_eq!(task.await.unwrap(), PublisherExit::Stopped);
    }

    #[tokio::test]
    async fn test_record_written_before_crash_is_published_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checker.db");

        // Committed, then the process dies before any tick
        let db = AsyncDatabase::open(&path).await.unwrap();
        let check = crate::PrimeCheckService::new(db.clone(), TracePropagator::new())
            .create_prime_check(1, "17", TraceContext::new())
            .await
            .unwrap();
        db.close().await.unwrap();

        let db = AsyncDatabase::open(&path).await.unwrap();
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = OutboxPublisher::new(
            Arc::new(SqliteOutboxStore::new(db.clone())),
            broker.clone(),
            PublisherConfig::default(),
            TracePropagator::new(),
        );
        let (_shutdown, signal) = idle_signal();
        let report = publisher.publish_pending(&signal).await.unwrap();
        assert_eq!(report.published(), 1);

        let sent: PrimeCheckPayload = broker.published("primecheck")[0].decode_payload().unwrap();
        assert_eq!(sent.request_id, check.id);
        let remaining = db.call(|conn| queries::list_unprocessed_outbox(conn)).await.unwrap();
        assert!(remaining.is_empty());
    }
}
