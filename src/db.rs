//! SQLite pool setup and schema creation.
//!
//! The schema is created idempotently on connect; the partial unique index
//! on running `run_records` is what makes opening a run a reservation.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS listings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL UNIQUE,
        title TEXT NOT NULL,
        company TEXT NOT NULL DEFAULT '',
        location TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        salary TEXT NOT NULL DEFAULT '',
        job_type TEXT NOT NULL DEFAULT '',
        posted_at TEXT NOT NULL DEFAULT '',
        role_slug TEXT NOT NULL DEFAULT 'other',
        source TEXT NOT NULL,
        is_fresh BOOLEAN NOT NULL DEFAULT 0,
        first_seen_at DATETIME NOT NULL,
        last_seen_at DATETIME NOT NULL,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS run_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source TEXT NOT NULL,
        keyword TEXT,
        status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
        jobs_found INTEGER NOT NULL DEFAULT 0,
        new_jobs INTEGER NOT NULL DEFAULT 0,
        started_at DATETIME NOT NULL,
        completed_at DATETIME,
        error TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_listings_source ON listings (source)",
    "CREATE INDEX IF NOT EXISTS idx_run_records_source_status ON run_records (source, status, completed_at)",
    // At most one open run per source: the ledger insert doubles as a reservation.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_run_records_one_running ON run_records (source) WHERE status = 'running'",
];

/// Owns the connection pool shared by the ledger and the ingestion engine.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `database_url` and apply the schema.
    #[instrument(level = "info", skip_all, fields(%database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!("Database ready");
        Ok(db)
    }

    /// A private in-memory database. A single connection that never expires,
    /// since each SQLite memory connection is its own database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}
