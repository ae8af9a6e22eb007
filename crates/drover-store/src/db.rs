use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Connection;
use tracing::debug;

use drover_core::error::{DroverError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    output TEXT,
    error TEXT
);

CREATE TABLE IF NOT EXISTS steps (
    job_id TEXT NOT NULL,
    step_id TEXT NOT NULL,
    phase_index INTEGER NOT NULL,
    phase_name TEXT NOT NULL,
    position INTEGER NOT NULL,
    capability TEXT NOT NULL,
    input_json TEXT NOT NULL,
    dependencies_json TEXT NOT NULL,
    status TEXT NOT NULL,
    output_json TEXT,
    error TEXT,
    optional INTEGER NOT NULL DEFAULT 0,
    tolerate_failed_deps INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    completed_at TEXT,
    PRIMARY KEY (job_id, step_id)
);

CREATE TABLE IF NOT EXISTS work_items (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    step_id TEXT NOT NULL,
    capability TEXT NOT NULL,
    input_json TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    result_json TEXT,
    enqueued_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_work_items_job ON work_items(job_id, enqueued_at);

CREATE TABLE IF NOT EXISTS queue_entries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id TEXT NOT NULL UNIQUE,
    lane TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_lane ON queue_entries(lane, priority, seq);

CREATE TABLE IF NOT EXISTS processing (
    item_id TEXT PRIMARY KEY,
    claimed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS retry_counts (
    item_id TEXT PRIMARY KEY,
    retries INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS results (
    item_id TEXT PRIMARY KEY,
    result_json TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letters (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id TEXT NOT NULL,
    error TEXT NOT NULL,
    retries INTEGER NOT NULL,
    failed_at TEXT NOT NULL
);
";

/// Shared SQLite handle. `SqliteStore` and `SqliteQueue` built from clones of
/// the same `Database` share one connection, which is what lets `:memory:`
/// databases back both in tests.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path. `:memory:` opens an
    /// in-memory database.
    pub fn open(path: &Path) -> Result<Self> {
        if path.as_os_str() == ":memory:" {
            return Self::in_memory();
        }

        // Create parent directories
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DroverError::Database(format!("Failed to create db directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL lets worker processes and the executor share the file
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// The guard never escapes this call, so callers inside async blocks
    /// never hold it across an `.await`.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| DroverError::Database(e.to_string()))?;
        f(&mut conn).map_err(db_err)
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> DroverError {
    DroverError::Database(e.to_string())
}

/// Wrap a decode failure so it can be raised from inside a row mapper.
pub(crate) fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Fixed-width RFC 3339 so text timestamps sort chronologically.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn parse_opt_ts(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("drover.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());

        let tables: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                     ('jobs', 'steps', 'work_items', 'queue_entries', 'dead_letters')",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_memory_path_is_in_memory() {
        let db = Database::open(Path::new(":memory:")).unwrap();
        let mode: String = db
            .with_conn(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(mode, "memory");
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_ts(0, &ts(&a)).unwrap().timestamp_micros(), a.timestamp_micros());
    }
}
