//! SQLite store for raw records, event clusters, and the alteration trail.
//!
//! The database lives at `~/.eventdesk/eventdesk.db` unless configured
//! otherwise. It runs in WAL mode with a busy timeout so that every pool
//! worker can hold its own connection and commit one unit at a time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection};

pub mod types;
pub use types::*;

pub mod alterations;
pub mod catalog;
pub mod clusters;
pub mod records;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DeskDb {
    conn: Connection,
    path: PathBuf,
}

impl DeskDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Path this connection was opened at. Workers open their own handle from it.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(DbError::from)?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT").map_err(DbError::from)?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open a database at an explicit path, applying pending migrations.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn, path })
    }
}

pub(crate) fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Collect mapped rows, surfacing the first row error.
pub(crate) fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, DbError> {
    let mut items = Vec::new();
    for row in rows {
        items.push(row?);
    }
    Ok(items)
}

impl DeskDb {
    /// Count rows per record status. Used for the run summary.
    pub fn record_status_counts(&self) -> Result<Vec<(String, i64)>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM raw_records GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map(params![], |row| Ok((row.get(0)?, row.get(1)?)))?;
        collect_rows(rows)
    }
}

// =============================================================================
// Shared test utilities
// =============================================================================
