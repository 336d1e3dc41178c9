//! Query helpers for the prime checker tables.
//!
//! Every function takes a `&Connection`. A `rusqlite::Transaction` derefs to
//! one, so the same helpers serve plain reads inside `db.call()` and writes
//! inside `db.transaction()`.

use crate::{
    DatabaseError, DatabaseResult, NewPrimeCheck, OutboxRecord, PrimeCheck,
    PrimeCheckResolution, PrimeCheckStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

const PRIME_CHECK_COLUMNS: &str =
    "id, user_id, number_text, status, is_prime, trace_id, message_id, created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, event_type, payload, processed, created_at, updated_at";

// ==========================================
// Prime checks
// ==========================================

/// Insert a new prime check in `pending` status.
pub fn insert_prime_check(conn: &Connection, check: &NewPrimeCheck) -> DatabaseResult<PrimeCheck> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO prime_checks (user_id, number_text, status, trace_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            check.user_id,
            check.number_text,
            PrimeCheckStatus::Pending.as_str(),
            check.trace_id,
            now,
        ],
    )?;
    let id = conn.last_insert_rowid();
    get_prime_check(conn, id)?
        .ok_or_else(|| DatabaseError::NotFound(format!("prime check {} after insert", id)))
}

/// Get a prime check by ID.
pub fn get_prime_check(conn: &Connection, id: i64) -> DatabaseResult<Option<PrimeCheck>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM prime_checks WHERE id = ?1",
        PRIME_CHECK_COLUMNS
    ))?;

    match stmt.query_row(params![id], map_prime_check) {
        Ok(check) => Ok(Some(check)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// List all prime checks, newest first.
pub fn list_prime_checks(conn: &Connection) -> DatabaseResult<Vec<PrimeCheck>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM prime_checks ORDER BY id DESC",
        PRIME_CHECK_COLUMNS
    ))?;
    let checks = stmt
        .query_map([], map_prime_check)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(checks)
}

/// Move a pending prime check to its terminal status.
///
/// Returns `false` when the row was already resolved (or does not exist),
/// which lets redelivered messages skip their side effects.
pub fn resolve_prime_check(
    conn: &Connection,
    resolution: &PrimeCheckResolution,
) -> DatabaseResult<bool> {
    if resolution.status == PrimeCheckStatus::Pending {
        return Err(DatabaseError::InvalidData(
            "a prime check cannot be resolved to pending".to_string(),
        ));
    }

    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE prime_checks
         SET status = ?1,
             is_prime = ?2,
             message_id = ?3,
             trace_id = COALESCE(?4, trace_id),
             updated_at = ?5
         WHERE id = ?6 AND status = 'pending'",
        params![
            resolution.status.as_str(),
            resolution.is_prime,
            resolution.message_id,
            resolution.trace_id,
            now,
            resolution.id,
        ],
    )?;
    Ok(updated == 1)
}

fn map_prime_check(row: &Row<'_>) -> rusqlite::Result<PrimeCheck> {
    Ok(PrimeCheck {
        id: row.get(0)?,
        user_id: row.get(1)?,
        number_text: row.get(2)?,
        status: parse_status(3, row.get(3)?)?,
        is_prime: row.get(4)?,
        trace_id: row.get(5)?,
        message_id: row.get(6)?,
        created_at: parse_datetime(row.get(7)?),
        updated_at: parse_datetime(row.get(8)?),
    })
}

// ==========================================
// Outbox
// ==========================================

/// Insert an unprocessed outbox record. Returns its ID.
pub fn insert_outbox_record(
    conn: &Connection,
    event_type: &str,
    payload: &[u8],
) -> DatabaseResult<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO outbox (event_type, payload, processed, created_at, updated_at)
         VALUES (?1, ?2, 0, ?3, ?3)",
        params![event_type, payload, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Get an outbox record by ID.
pub fn get_outbox_record(conn: &Connection, id: i64) -> DatabaseResult<Option<OutboxRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM outbox WHERE id = ?1",
        OUTBOX_COLUMNS
    ))?;

    match stmt.query_row(params![id], map_outbox_record) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// All unprocessed outbox records in ascending ID order.
pub fn list_unprocessed_outbox(conn: &Connection) -> DatabaseResult<Vec<OutboxRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM outbox WHERE processed = 0 ORDER BY id ASC",
        OUTBOX_COLUMNS
    ))?;
    let records = stmt
        .query_map([], map_outbox_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// All outbox records of one event type in ascending ID order.
pub fn list_outbox_by_event_type(
    conn: &Connection,
    event_type: &str,
) -> DatabaseResult<Vec<OutboxRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM outbox WHERE event_type = ?1 ORDER BY id ASC",
        OUTBOX_COLUMNS
    ))?;
    let records = stmt
        .query_map(params![event_type], map_outbox_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Flag an outbox record as published.
///
/// Returns `true` if this call flipped the flag, `false` if it was already
/// set or the record does not exist. Neither case is an error.
pub fn mark_outbox_processed(conn: &Connection, id: i64) -> DatabaseResult<bool> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE outbox SET processed = 1, updated_at = ?1 WHERE id = ?2 AND processed = 0",
        params![now, id],
    )?;
    Ok(updated == 1)
}

fn map_outbox_record(row: &Row<'_>) -> rusqlite::Result<OutboxRecord> {
    Ok(OutboxRecord {
        id: row.get(0)?,
        event_type: row.get(1)?,
        payload: row.get(2)?,
        processed: row.get(3)?,
        created_at: parse_datetime(row.get(4)?),
        updated_at: parse_datetime(row.get(5)?),
    })
}

// ==========================================
// Helpers
// ==========================================

fn parse_status(idx: usize, s: String) -> rusqlite::Result<PrimeCheckStatus> {
    PrimeCheckStatus::from_str(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown prime check status: {}", s).into(),
        )
    })
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
