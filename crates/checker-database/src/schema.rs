//! Schema bootstrap.
//!
//! A single idempotent batch; there is no version table. Running it against
//! an existing database is a no-op.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS prime_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    number_text TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'completed', 'failed')),
    is_prime INTEGER,
    trace_id TEXT,
    message_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prime_checks_user ON prime_checks(user_id);

CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL CHECK (length(event_type) > 0),
    payload BLOB NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0 CHECK (processed IN (0, 1)),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outbox_unprocessed ON outbox(processed, id);

CREATE TRIGGER IF NOT EXISTS outbox_processed_is_final
BEFORE UPDATE OF processed ON outbox
WHEN OLD.processed = 1 AND NEW.processed = 0
BEGIN
    SELECT RAISE(ABORT, 'processed outbox records cannot revert');
END;
"#;

/// Create the tables, indexes and triggers if they do not exist.
pub fn bootstrap_schema(conn: &Connection) -> DatabaseResult<()> {
    conn.execute_batch(SCHEMA)?;
    debug!("Schema bootstrap complete");
    Ok(())
}
