//! Database layer with SQLite
//!
//! One bundled SQLite file holds everything durable armada owns: instance
//! records, per-instance reannounce tuning, and the activity log. Schema
//! changes ship as numbered migrations gated on `user_version`, so a file
//! from an older build upgrades in place on startup.

pub mod activity;
pub mod instances;
pub mod settings;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

use crate::config::DatabaseSettings;

/// Numbered schema migrations; `user_version` records how many have run
const MIGRATIONS: &[&str] = &[include_str!("../../migrations/001_initial.sql")];

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database file named in the settings
    pub fn open(settings: &DatabaseSettings) -> Result<Self> {
        if let Some(parent) = settings.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let conn = Connection::open(&settings.path)
            .with_context(|| format!("Failed to open database at {:?}", settings.path))?;
        Self::apply_pragmas(&conn, settings)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn, &DatabaseSettings::default())?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// WAL so the activity sink never blocks readers; the busy timeout
    /// covers the sink and the admin API writing concurrently.
    fn apply_pragmas(conn: &Connection, settings: &DatabaseSettings) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = {};",
            settings.busy_timeout_ms
        ))
        .context("Failed to apply connection pragmas")?;
        Ok(())
    }

    /// Apply any migrations newer than the file's recorded schema version
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        let applied: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        for (n, sql) in MIGRATIONS.iter().enumerate().skip(applied as usize) {
            conn.execute_batch(sql)
                .with_context(|| format!("Migration {:03} failed", n + 1))?;
            conn.pragma_update(None, "user_version", (n + 1) as i64)?;
        }
        Ok(())
    }

    /// Get a connection for executing queries
    pub fn conn(&self) -> std::sync::MutexGuard<Connection> {
        self.conn.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_record_schema_version() {
        let db = Database::in_memory().unwrap();
        let version: i64 = db
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::in_memory().unwrap();
        // Already migrated by in_memory(); a second run must be a no-op.
        db.migrate().unwrap();
        let count: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'instances'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
