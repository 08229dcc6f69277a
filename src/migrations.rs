//! Schema migrations.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.
//! A file-backed database is copied with SQLite's online backup API before
//! any pending migration touches it.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("migrations/001_baseline.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("migrations/002_lookup_indexes.sql"),
    },
];

const SCHEMA_VERSION_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);";

/// Highest applied version; 0 on a fresh store.
fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
        row.get(0)
    })
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Copy a file-backed store that already holds data to `<path>.pre-migration.bak`.
fn backup_before_migration(conn: &Connection, current: i32) -> Result<(), String> {
    if current == 0 {
        return Ok(());
    }
    let db_path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("Failed to resolve store path: {}", e))?;
    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut target =
        Connection::open(&backup_path).map_err(|e| format!("Failed to open {}: {}", backup_path, e))?;
    rusqlite::backup::Backup::new(conn, &mut target)
        .and_then(|backup| backup.step(-1).map(|_| ()))
        .map_err(|e| format!("Pre-migration backup failed: {}", e))?;

    log::info!("Migrations: backed up v{} store to {}", current, backup_path);
    Ok(())
}

/// Apply every pending migration, each in its own transaction with its
/// version stamp.
///
/// Returns how many were applied. A store stamped newer than the newest
/// known migration is refused.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    conn.execute_batch(SCHEMA_VERSION_DDL)
        .map_err(|e| format!("Failed to create schema_version: {}", e))?;

    let current = current_version(conn)?;
    let newest = MIGRATIONS.last().map_or(0, |m| m.version);
    if current > newest {
        return Err(format!(
            "Store schema v{} is newer than this eventdesk build understands (v{})",
            current, newest
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(0);
    }
    backup_before_migration(conn, current)?;

    for migration in &pending {
        let script = format!(
            "BEGIN;\n{}\nINSERT INTO schema_version (version) VALUES ({});\nCOMMIT;",
            migration.sql, migration.version
        );
        if let Err(e) = conn.execute_batch(&script) {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(format!("Migration v{} failed: {}", migration.version, e));
        }
        log::info!("Migrations: applied v{}", migration.version);
    }
    Ok(pending.len())
}
