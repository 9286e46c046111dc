//! Persistence layer backed by sqlite through `sqlx`.
//!
//! The [`Store`] handle is cheap to clone and is passed explicitly into
//! every component that persists state. Queries are grouped by table:
//!
//! - [`instances`]: instance rows and their lifecycle columns
//! - [`ports`]: port assignments and the `reserved_ports` uniqueness table
//! - [`records`]: container records
//! - [`tokens`]: access tokens and instance bindings
//! - [`leases`]: job leases for overlap-skipping recurring passes
//!
//! Timestamps are stored as UTC unix milliseconds.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;

pub mod instances;
pub mod leases;
pub mod ports;
pub mod records;
pub mod tokens;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS instances (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        spec TEXT NOT NULL,
        desired TEXT NOT NULL,
        observed TEXT NOT NULL,
        busy TEXT,
        last_error TEXT,
        warnings TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        scheduled_deletion_at INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS port_assignments (
        instance_id TEXT PRIMARY KEY,
        game_port INTEGER NOT NULL,
        query_port INTEGER NOT NULL,
        rcon_port INTEGER NOT NULL,
        allocated_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS reserved_ports (
        port INTEGER PRIMARY KEY,
        instance_id TEXT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_reserved_ports_instance
        ON reserved_ports (instance_id)"#,
    r#"CREATE TABLE IF NOT EXISTS container_records (
        instance_id TEXT PRIMARY KEY,
        container_name TEXT NOT NULL UNIQUE,
        container_id TEXT,
        runtime_status TEXT NOT NULL,
        last_outcome TEXT,
        launch_fingerprint TEXT,
        updated_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS access_tokens (
        id TEXT PRIMARY KEY,
        token TEXT NOT NULL UNIQUE,
        token_type TEXT NOT NULL,
        owner TEXT,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        activated_at INTEGER,
        active INTEGER NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS instance_tokens (
        instance_id TEXT NOT NULL,
        token_id TEXT NOT NULL,
        PRIMARY KEY (instance_id, token_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS job_leases (
        name TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )"#,
];

/// Shared handle to the fleet database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (creating if missing) the database at `url` and apply the schema.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Opened fleet store at {}", url);
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs.
    ///
    /// A single long-lived connection keeps the database alive.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create every table and index that does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema up to date ({} statements)", SCHEMA.len());
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Build a decode error for a column holding an unparseable value.
pub(crate) fn decode_error(column: &str, detail: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(format!("column {}: {}", column, detail).into())
}

/// Whether an error is a uniqueness violation
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fleet.db");
        let url = format!("sqlite://{}", path.display());

        let store = Store::open(&url, 2).await.unwrap();
        assert!(path.exists());
        store.close().await;
    }
}
