//! Stream courier: durable, pull-based message delivery.
//!
//! Moves [`Envelope`]s from the outbox publisher to workers through a
//! [`BrokerGateway`]. Production uses Redis Streams with one consumer group
//! per topic; tests use [`InMemoryBroker`].
//!
//! # Core Invariants
//!
//! 1. **Durable**: a publish returns only after the broker stored the entry
//! 2. **At-least-once**: a message leaves the pending set only on ACK
//! 3. **Backoff on NAK**: a rejected message is redelivered after
//!    `base * 2^(deliveries-1)`, capped
//! 4. **Poison containment**: undecodable messages, permanent handler
//!    failures and messages past `max_deliveries` are ACKed and logged
//!
//! # Architecture
//!
//! ```text
//! Publisher -> XADD T_stream -> XREADGROUP (T_consumer) -> Subscriber -> handler
//!                                    ^                          |
//!                                    |_____ XACK / XCLAIM <_____|
//! ```

pub mod envelope;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod redis_gateway;
pub mod subscription;
pub mod topic;

pub use envelope::{EmailSendPayload, Envelope, MessageType, PrimeCheckPayload};
pub use error::{CourierError, CourierResult};
pub use gateway::{BrokerGateway, Delivery, RedeliveryPolicy};
pub use memory::InMemoryBroker;
pub use observability::TraceContext;
pub use redis_gateway::{RedisGatewayConfig, RedisStreamsGateway};
pub use subscription::{
    run_subscription, HandlerError, MessageHandler, SubscribeOptions, Subscriber,
    SubscriptionExit, SubscriptionStats,
};
pub use topic::{consumer_group_name, stream_name, validate_topic};
