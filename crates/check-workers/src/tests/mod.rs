//! End-to-end tests for the prime checker pipeline.
//!
//! Everything runs in process: in-memory SQLite, the in-memory broker and
//! a recording email sender stand in for the database file, Redis and the
//! SMTP relay.
//!
//! - `harness.rs`  - Pipeline wiring and polling helpers
//! - `pipeline.rs` - Submit-to-email scenarios
//! - `delivery.rs` - At-least-once delivery, redelivery and poison containment
//! - `trace_context.rs` - Trace context carried from submit to email

mod delivery;
