//! Outbox store.
//!
//! Writes and reads are split. [`append`] takes a `&Transaction`, so it can
//! only run inside a transaction the caller already opened and will commit
//! together with the domain row. The publisher reads through the
//! [`OutboxStore`] trait.

use crate::OutboxResult;
use async_trait::async_trait;
use checker_database::{queries, AsyncDatabase, DatabaseError, DatabaseResult, OutboxRecord};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Transaction;
use std::collections::HashSet;
use stream_courier::Envelope;
use tracing::debug;

/// Append an unprocessed record inside `tx`. Returns its ID.
///
/// Fails with a persistence error on a constraint violation (such as an
/// empty `event_type`); the caller's transaction then rolls back.
pub fn append(tx: &Transaction<'_>, event_type: &str, payload: &[u8]) -> DatabaseResult<i64> {
    let id = queries::insert_outbox_record(tx, event_type, payload)?;
    debug!(record_id = id, event_type = %event_type, "Appended outbox record");
    Ok(id)
}

/// Serialize `envelope` and append it under its type tag.
pub fn append_envelope(tx: &Transaction<'_>, envelope: &Envelope) -> DatabaseResult<i64> {
    let payload = serde_json::to_vec(envelope)?;
    append(tx, envelope.message_type.as_str(), &payload)
}

/// Publisher-facing outbox operations.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Every record with `processed = false`, ascending by ID. No side
    /// effects.
    async fn list_unprocessed(&self) -> OutboxResult<Vec<OutboxRecord>>;

    /// Set `processed = true`. Returns whether this call flipped the flag;
    /// marking an already-processed record is not an error.
    async fn mark_processed(&self, id: i64) -> OutboxResult<bool>;
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    db: AsyncDatabase,
}

impl SqliteOutboxStore {
    pub fn new(db: AsyncDatabase) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &AsyncDatabase {
        &self.db
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn list_unprocessed(&self) -> OutboxResult<Vec<OutboxRecord>> {
        Ok(self
            .db
            .call(|conn| queries::list_unprocessed_outbox(conn))
            .await?)
    }

    async fn mark_processed(&self, id: i64) -> OutboxResult<bool> {
        Ok(self
            .db
            .call(move |conn| queries::mark_outbox_processed(conn, id))
            .await?)
    }
}

#[derive(Default)]
struct MemoryState {
    records: Vec<OutboxRecord>,
    next_id: i64,
    fail_reads: bool,
    fail_marks: HashSet<i64>,
}

/// In-memory store with failure injection, for tests.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    state: Mutex<MemoryState>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an unprocessed record. Returns its ID.
    pub fn insert(&self, event_type: &str, payload: Vec<u8>) -> i64 {
        let mut state = self.state.lock();
        state.next_id += 1;
        let now = Utc::now();
        let id = state.next_id;
        state.records.push(OutboxRecord {
            id,
            event_type: event_type.to_string(),
            payload,
            processed: false,
            created_at: now,
            updated_at: now,
        });
        id
    }

    /// Add `envelope` as an unprocessed record.
    pub fn insert_envelope(&self, envelope: &Envelope) -> DatabaseResult<i64> {
        let payload = serde_json::to_vec(envelope)?;
        Ok(self.insert(envelope.message_type.as_str(), payload))
    }

    pub fn get(&self, id: i64) -> Option<OutboxRecord> {
        self.state.lock().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn is_processed(&self, id: i64) -> bool {
        self.get(id).is_some_and(|r| r.processed)
    }

    pub fn unprocessed_count(&self) -> usize {
        self.state.lock().records.iter().filter(|r| !r.processed).count()
    }

    /// Make `list_unprocessed` fail until turned off again.
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Make `mark_processed(id)` fail until cleared.
    pub fn fail_marks_for(&self, id: i64) {
        self.state.lock().fail_marks.insert(id);
    }

    pub fn clear_mark_failures(&self) {
        self.state.lock().fail_marks.clear();
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn list_unprocessed(&self) -> OutboxResult<Vec<OutboxRecord>> {
        let state = self.state.lock();
        if state.fail_reads {
            return Err(DatabaseError::Connection("injected read failure".to_string()).into());
        }
        // Records are pushed in ID order
        Ok(state.records.iter().filter(|r| !r.processed).cloned().collect())
    }

    async fn mark_processed(&self, id: i64) -> OutboxResult<bool> {
        let mut state = self.state.lock();
        if state.fail_marks.contains(&id) {
            return Err(DatabaseError::Connection(format!("injected mark failure for {}", id)).into());
        }
        match state.records.iter_mut().find(|r| r.id == id) {
            Some(record) if !record.processed => {
                record.processed = true;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutboxError;
    use stream_courier::{MessageType, PrimeCheckPayload, TraceContext};

    fn envelope() -> Envelope {
        Envelope::new(
            MessageType::PrimeCheck,
            &PrimeCheckPayload {
                request_id: 1,
                user_id: 1,
                number_text: "17".to_string(),
            },
            TraceContext::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_append_inside_transaction() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let env = envelope();
        let id = db
            .transaction(move |tx| append_envelope(tx, &env))
            .await
            .unwrap();

        let store = SqliteOutboxStore::new(db);
        let records = store.list_unprocessed().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].event_type, "prime_check");
        assert!(!records[0].processed);

        let stored = Envelope::from_bytes(&records[0].payload).unwrap();
        assert_eq!(stored.message_type, MessageType::PrimeCheck);
    }

    #[tokio::test]
    async fn test_append_constraint_violation_rolls_back() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let result = db
            .transaction(|tx| {
                append(tx, "prime_check", b"{}")?;
                append(tx, "", b"{}")
            })
            .await;
        assert!(matches!(result, Err(DatabaseError::Sqlite(_))));

        let store = SqliteOutboxStore::new(db);
        assert!(store.list_unprocessed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_unprocessed_is_ordered_and_rerunnable() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        db.transaction(|tx| {
            for event_type in ["prime_check", "email_send", "prime_check"] {
                append(tx, event_type, b"{}")?;
            }
            Ok(())
        })
        .await
        .unwrap();
        let store = SqliteOutboxStore::new(db);

        let first: Vec<i64> = store.list_unprocessed().await.unwrap().iter().map(|r| r.id).collect();
        let second: Vec<i64> = store.list_unprocessed().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_mark_processed_twice_is_noop() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let id = db
            .transaction(|tx| append(tx, "prime_check", b"{}"))
            .await
            .unwrap();
        let store = SqliteOutboxStore::new(db.clone());

        assert!(store.mark_processed(id).await.unwrap());
        assert!(!store.mark_processed(id).await.unwrap());

        let record = db
            .call(move |conn| queries::get_outbox_record(conn, id))
            .await
            .unwrap()
            .unwrap();
        assert!(record.processed);
        assert!(store.list_unprocessed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_processed_unknown_id_is_noop() {
        let store = SqliteOutboxStore::new(AsyncDatabase::open_in_memory().await.unwrap());
        assert!(!store.mark_processed(999).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_store_matches_contract() {
        let store = InMemoryOutboxStore::new();
        let a = store.insert_envelope(&envelope()).unwrap();
        let b = store.insert("email_send", b"{}".to_vec());

        let ids: Vec<i64> = store.list_unprocessed().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, b]);

        assert!(store.mark_processed(a).await.unwrap());
        assert!(!store.mark_processed(a).await.unwrap());
        assert!(store.is_processed(a));
        assert_eq!(store.unprocessed_count(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_failure_injection() {
        let store = InMemoryOutboxStore::new();
        let id = store.insert("prime_check", b"{}".to_vec());

        store.set_fail_reads(true);
        assert!(matches!(
            store.list_unprocessed().await,
            Err(OutboxError::Persistence(_))
        ));
        store.set_fail_reads(false);

        store.fail_marks_for(id);
        assert!(store.mark_processed(id).await.is_err());
        store.clear_mark_failures();
        assert!(store.mark_processed(id).await.unwrap());
    }
}
