//! Durable storage for siphon.
//!
//! Everything the sync engine and the job claimers share lives here: the
//! seen ledger (what exists), the job table (what the pipeline still has to
//! do), a string key/value state table and per-kind operator overrides.
//!
//! All coordination between concurrent workers happens through guarded
//! single-statement updates; no transaction spans more than one table.
//!
//! # Usage
//!
//! ```rust,ignore
//! use siphon_db::{SiphonDb, Result};
//!
//! let db = SiphonDb::open("~/.siphon/siphon.db").await?;
//! let stats = db.queue_stats().await?;
//! let jobs = db.claim_jobs(5, chrono::Duration::minutes(10), chrono::Utc::now()).await?;
//! ```

mod error;
mod jobs;
mod schema;
mod seen;
mod state;
mod types;

pub use error::{DbError, Result};
pub use seen::MAX_LOOKUP_CHUNK;
pub use types::*;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the siphon database. Cheap to clone.
#[derive(Clone)]
pub struct SiphonDb {
    pool: SqlitePool,
}

impl SiphonDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open a private in-memory database.
    ///
    /// Pinned to one connection that never idles out; every SQLite memory
    /// connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Get the underlying pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::invalid_data(format!("timestamp out of range: {ms}")))
}

pub(crate) fn from_millis_opt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}
