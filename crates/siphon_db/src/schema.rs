//! Database schema creation for all siphon tables.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::SiphonDb;
use tracing::debug;

impl SiphonDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        self.create_seen_tables().await?;
        self.create_job_tables().await?;
        self.create_state_tables().await?;

        debug!("Database schema verified");
        Ok(())
    }

    /// Seen ledger: last observed version of every content unit.
    async fn create_seen_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS siphon_seen (
                content_id BLOB PRIMARY KEY,
                source_system TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                source_locator TEXT NOT NULL,
                container_id INTEGER,
                source_int_id INTEGER,
                last_seen_version TEXT NOT NULL,
                last_seen_version_token TEXT,
                last_seen_at INTEGER NOT NULL,
                missing_since INTEGER,
                delete_job_id INTEGER,
                deleted_at INTEGER,
                UNIQUE (source_system, source_kind, source_locator)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_siphon_seen_int_id ON siphon_seen(source_system, source_kind, source_int_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_siphon_seen_kind ON siphon_seen(source_kind, content_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Job table: upsert/delete work with lease fields.
    async fn create_job_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS siphon_jobs (
                job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_id BLOB NOT NULL,
                source_kind TEXT NOT NULL,
                source_locator TEXT,
                container_id INTEGER,
                source_int_id INTEGER,
                source_version TEXT NOT NULL,
                source_version_token TEXT,
                job_type TEXT NOT NULL CHECK (job_type IN ('upsert', 'delete')),
                state TEXT NOT NULL DEFAULT 'pending'
                    CHECK (state IN ('pending', 'running', 'done', 'error', 'superseded')),
                priority INTEGER NOT NULL DEFAULT 1,
                attempts INTEGER NOT NULL DEFAULT 0,
                locked_until INTEGER,
                claim_token TEXT,
                claimed_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                error_message TEXT,
                UNIQUE (content_id, source_version, job_type)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_siphon_jobs_claim ON siphon_jobs(state, priority DESC, job_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_siphon_jobs_content ON siphon_jobs(content_id, job_type, state)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_siphon_jobs_kind ON siphon_jobs(source_kind, state)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_siphon_jobs_token ON siphon_jobs(claim_token)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Key/value process state and operator kind overrides.
    async fn create_state_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS siphon_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS siphon_kind_settings (
                kind TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
