//! Database manager for SQLite storage.
//!
//! ## Migration System
//!
//! Migrations are numbered sequentially (001, 002, ...) and stored in the
//! `migrations/` directory. Each migration runs exactly once, tracked via
//! the `schema_migrations` table.
//!
//! To add a new migration:
//! 1. Create a new file: `migrations/NNN_description.sql`
//! 2. Add the migration to the `MIGRATIONS` array below
//! 3. The migration will auto-run on next daemon startup

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Errors opening or migrating the database.
///
/// Migration failures are split out so the daemon can exit with a
/// distinct code for them.
#[derive(Debug, Error)]
pub enum StoreInitError {
    #[error("failed to open database: {0}")]
    Open(#[source] rusqlite::Error),

    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },

    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: &'static str,
        #[source]
        source: rusqlite::Error,
    },
}

impl StoreInitError {
    /// True when the failure happened while applying a migration.
    pub fn is_migration_failure(&self) -> bool {
        matches!(self, StoreInitError::Migration { .. })
    }
}

/// A database migration with version number and SQL content.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new migrations here.
const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial",
    sql: include_str!("migrations/001_initial.sql"),
}];

/// SQLite database wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path.
    ///
    /// If the database doesn't exist, it will be created. All pending
    /// migrations will be automatically applied.
    pub fn open(path: &Path) -> Result<Self, StoreInitError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreInitError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path).map_err(StoreInitError::Open)?;

        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreInitError::Open)?;
        // WAL journal mode for concurrent readers alongside the writer
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreInitError::Open)?;

        debug!("Opened database at {:?}", path);

        let db = Self { conn };
        db.run_migrations()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreInitError> {
        let conn = Connection::open_in_memory().map_err(StoreInitError::Open)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(StoreInitError::Open)?;

        debug!("Opened in-memory database");

        let db = Self { conn };
        db.run_migrations()?;

        Ok(db)
    }

    /// Run all pending database migrations.
    fn run_migrations(&self) -> Result<(), StoreInitError> {
        self.ensure_migrations_table()?;

        let current_version = self.get_schema_version();
        info!(
            "Current database schema version: {}, latest available: {}",
            current_version,
            MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
        );

        for migration in MIGRATIONS {
            if migration.version > current_version {
                info!(
                    "Running migration {} ({})...",
                    migration.version, migration.name
                );

                let fail = |source| StoreInitError::Migration {
                    version: migration.version,
                    name: migration.name,
                    source,
                };

                let tx = self.conn.unchecked_transaction().map_err(fail)?;
                self.conn.execute_batch(migration.sql).map_err(fail)?;
                self.conn
                    .execute(
                        "INSERT OR REPLACE INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, datetime('now'))",
                        rusqlite::params![migration.version, migration.name],
                    )
                    .map_err(fail)?;
                tx.commit().map_err(fail)?;

                info!(
                    "Migration {} ({}) completed successfully",
                    migration.version, migration.name
                );
            }
        }

        Ok(())
    }

    fn ensure_migrations_table(&self) -> Result<(), StoreInitError> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                )",
                [],
            )
            .map_err(StoreInitError::Open)?;
        Ok(())
    }

    /// Get the current schema version (highest applied migration).
    fn get_schema_version(&self) -> i64 {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0)
    }

    /// Get a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
