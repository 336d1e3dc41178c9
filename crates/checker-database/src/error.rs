//! Database error types.

use thiserror::Error;

/// Errors from the SQLite layer.
///
/// Everything here is a `PersistenceError` to callers: the row and outbox
/// writes either both happened or neither did.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Executor thread gone or the file could not be opened.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value does not map back to a model (bad status, bad timestamp).
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
