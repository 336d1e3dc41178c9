//! SQLite database layer for the prime checker.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread and a transaction helper
//! - Idempotent schema bootstrap for `prime_checks` and `outbox`
//! - Model types for both tables
//! - Query helpers that take a `&Connection`, so they run equally inside
//!   `db.call()` or inside a caller's transaction
//!
//! # Transactions
//!
//! ```ignore
//! let check = db.transaction(|tx| {
//!     let check = queries::insert_prime_check(tx, &new_check)?;
//!     queries::insert_outbox_record(tx, "prime_check", &payload)?;
//!     Ok(check)
//! }).await?;
//! ```
//!
//! The closure's `Err` rolls the transaction back; nothing it wrote is
//! visible afterwards.

mod error;
mod executor;
mod models;
pub mod queries;
mod schema;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use models::*;
pub use schema::bootstrap_schema;
