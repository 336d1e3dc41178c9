//! Transactional outbox for reliable event delivery.
//!
//! This crate provides:
//! - `append`: writes an outbox record inside the caller's transaction
//! - `OutboxStore`: the publisher's view of the outbox (SQLite and in-memory)
//! - `PrimeCheckService`: the producer-side write and plain reads
//! - `OutboxPublisher`: timer-driven poller that publishes unprocessed
//!   records to the broker and marks them processed
//!
//! A domain row and its outbox record are committed together or not at
//! all. Delivery happens later and at least once.

mod error;
mod producer;
mod publisher;
mod store;

pub use error::{OutboxError, OutboxResult};
pub use producer::PrimeCheckService;
pub use publisher::{
    OutboxPublisher, PublicationOutcome, PublicationResult, PublisherConfig, PublisherExit,
    PublisherState, TickReport, UndecodableRecord, MAX_PUBLISH_INTERVAL, MIN_PUBLISH_INTERVAL,
    UNDECODABLE_RECORD_TYPE,
};
pub use store::{append, append_envelope, InMemoryOutboxStore, OutboxStore, SqliteOutboxStore};
