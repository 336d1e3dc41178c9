//! Single-connection SQLite executor.
//!
//! One `tokio_rusqlite` connection owns a background thread; every closure
//! handed to [`AsyncDatabase::call`] or [`AsyncDatabase::transaction`] runs
//! there, one at a time, in submission order. Clones share the connection.
//!
//! Keep closures to SQL and row mapping. Broker publishes, SMTP and
//! primality checks run outside, so no transaction is held across a network
//! call.

use crate::{bootstrap_schema, DatabaseError, DatabaseResult};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

/// Pragmas for an on-disk database. WAL lets the publisher read while a
/// worker writes.
const FILE_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys = ON;";

const MEMORY_PATH: &str = ":memory:";

fn executor_error(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

/// Handle to the prime checker database.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open (creating if needed) the database file at `path` and bootstrap
    /// the schema. Missing parent directories are created.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let path = path.to_string_lossy().into_owned();
        let conn = Connection::open(&path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        let db = Self::prepare(conn, path, FILE_PRAGMAS).await?;
        info!(path = %db.path, "Database opened");
        Ok(db)
    }

    /// Private in-memory database, for tests.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        Self::prepare(conn, MEMORY_PATH.to_string(), MEMORY_PRAGMAS).await
    }

    async fn prepare(conn: Connection, path: String, pragmas: &'static str) -> DatabaseResult<Self> {
        let db = Self { conn, path };
        db.call(move |conn| {
            conn.execute_batch(pragmas)?;
            bootstrap_schema(conn)
        })
        .await?;
        Ok(db)
    }

    /// Run `f` on the connection thread and wait for its result.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // The closure's own result rides inside the executor's Ok
        self.conn
            .call(move |conn| Ok(f(conn)))
            .await
            .map_err(executor_error)?
    }

    /// Run `f` inside one transaction.
    ///
    /// Commits when `f` returns `Ok`. On `Err` the transaction is dropped
    /// unfinished, which rolls it back; a failed commit rolls back too.
    pub async fn transaction<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let result = f(&tx);
                match result {
                    Ok(value) => {
                        tx.commit()?;
                        Ok(Ok(value))
                    }
                    Err(e) => {
                        debug!(error = %e, "Transaction rolled back");
                        Ok(Err(e))
                    }
                }
            })
            .await
            .map_err(executor_error)?
    }

    /// File path, or `:memory:`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call(|conn| Ok(conn.execute_batch("SELECT 1")?)).await
    }

    /// Wait for queued closures, then stop the connection thread.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("close failed: {:?}", e)))?;
        debug!(path = %self.path, "Database closed");
        Ok(())
    }
}
