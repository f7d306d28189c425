//! Job table operations: insert, supersede, claim, ack, fail.

use crate::error::{DbError, Result};
use crate::types::*;
use crate::{from_millis, from_millis_opt, now_millis, SiphonDb};
use chrono::{DateTime, Duration, Utc};
use siphon_ids::{ClaimToken, ContentId, JobId};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, warn};

const JOB_COLUMNS: &str = "job_id, content_id, source_kind, source_locator, container_id, \
     source_int_id, source_version, source_version_token, job_type, state, priority, attempts, \
     locked_until, claim_token, claimed_at, created_at, updated_at, error_message";

impl SiphonDb {
    // ========================================================================
    // Job creation
    // ========================================================================

    /// Insert a pending upsert job; a duplicate version is ignored.
    pub async fn insert_upsert_job(&self, job: &NewJob) -> Result<EnqueueResult> {
        self.insert_job(job, JobType::Upsert).await
    }

    /// Insert a pending delete job and link it from the ledger row.
    pub async fn insert_delete_job(&self, job: &NewJob) -> Result<EnqueueResult> {
        let result = self.insert_job(job, JobType::Delete).await?;
        if let EnqueueResult::Created(job_id) = result {
            self.set_delete_job(&job.content_id, job_id).await?;
        }
        Ok(result)
    }

    async fn insert_job(&self, job: &NewJob, job_type: JobType) -> Result<EnqueueResult> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO siphon_jobs (
                content_id, source_kind, source_locator, container_id, source_int_id,
                source_version, source_version_token, job_type, state, priority,
                attempts, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, 0, ?, ?)
            "#,
        )
        .bind(job.content_id.as_bytes().to_vec())
        .bind(&job.source_kind)
        .bind(job.source_locator.as_deref())
        .bind(job.container_id)
        .bind(job.source_int_id)
        .bind(&job.source_version)
        .bind(job.source_version_token.as_deref())
        .bind(job_type.as_str())
        .bind(job.priority)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                content_id = %job.content_id,
                version = %job.source_version,
                job_type = %job_type,
                "Job already exists for this version"
            );
            return Ok(EnqueueResult::Duplicate);
        }

        Ok(EnqueueResult::Created(JobId::new(result.last_insert_rowid())))
    }

    // ========================================================================
    // Supersession and kind teardown
    // ========================================================================

    /// Move still-pending upserts of one content unit to `superseded`.
    ///
    /// A job at `keep_version` is left alone so that re-enqueueing the same
    /// version never retires the row it would have re-inserted. Running jobs
    /// are never touched.
    pub async fn supersede_pending_upserts(
        &self,
        content_id: &ContentId,
        source_kind: &str,
        keep_version: Option<&str>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE siphon_jobs SET state = 'superseded', updated_at = ?
            WHERE content_id = ? AND source_kind = ? AND job_type = 'upsert'
              AND state = 'pending'
              AND (? IS NULL OR source_version <> ?)
            "#,
        )
        .bind(now_millis())
        .bind(content_id.as_bytes().to_vec())
        .bind(source_kind)
        .bind(keep_version)
        .bind(keep_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Move still-pending deletes of one content unit to `superseded`.
    ///
    /// Called when the unit re-appears in the source: the delete no longer
    /// describes it. A running delete is left to finish.
    pub async fn supersede_pending_deletes(&self, content_id: &ContentId) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE siphon_jobs SET state = 'superseded', updated_at = ?
            WHERE content_id = ? AND job_type = 'delete' AND state = 'pending'
            "#,
        )
        .bind(now_millis())
        .bind(content_id.as_bytes().to_vec())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Supersede every pending upsert of a kind.
    pub async fn supersede_pending_upserts_for_kind(&self, source_kind: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE siphon_jobs SET state = 'superseded', updated_at = ?
            WHERE source_kind = ? AND job_type = 'upsert' AND state = 'pending'
            "#,
        )
        .bind(now_millis())
        .bind(source_kind)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Remove all job rows of a kind so identical future jobs can be inserted.
    pub async fn delete_jobs_for_kind(&self, source_kind: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM siphon_jobs WHERE source_kind = ?")
            .bind(source_kind)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // Claiming
    // ========================================================================

    /// Return running jobs whose lease ran out to the claim pool.
    ///
    /// Rows that already used `max_attempts` claims go to `error` instead.
    pub async fn release_expired_leases(
        &self,
        now: DateTime<Utc>,
        max_attempts: i64,
    ) -> Result<ReleasedLeases> {
        let now_ms = now.timestamp_millis();

        let errored = sqlx::query(
            r#"
            UPDATE siphon_jobs
            SET state = 'error', locked_until = NULL, claim_token = NULL,
                error_message = 'lease expired', updated_at = ?
            WHERE state = 'running' AND locked_until < ? AND attempts >= ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            r#"
            UPDATE siphon_jobs
            SET state = 'pending', locked_until = NULL, claim_token = NULL, updated_at = ?
            WHERE state = 'running' AND locked_until < ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if requeued + errored > 0 {
            warn!(requeued, errored, "Released expired job leases");
        }

        Ok(ReleasedLeases { requeued, errored })
    }

    /// Lease up to `limit` pending jobs.
    ///
    /// Candidates are picked by `priority DESC, job_id ASC`, then flipped to
    /// `running` by an update that re-checks `state = 'pending'`. That guard is
    /// the compare-and-swap: when two claimers race for a row only one update
    /// matches it. Each claim writes a fresh token and only rows carrying that
    /// token are returned.
    ///
    /// A job is held back while a job of the other type for the same content
    /// is running under a live lease, so upserts and deletes of one unit
    /// reach the pipeline in claim order.
    pub async fn claim_jobs(
        &self,
        limit: i64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let now_ms = now.timestamp_millis();

        let rows = sqlx::query(
            r#"
            SELECT j.job_id FROM siphon_jobs j
            WHERE j.state = 'pending'
              AND (j.locked_until IS NULL OR j.locked_until < ?)
              AND NOT EXISTS (
                SELECT 1 FROM siphon_jobs r
                WHERE r.content_id = j.content_id
                  AND r.job_type <> j.job_type
                  AND r.state = 'running'
                  AND r.locked_until >= ?
              )
            ORDER BY j.priority DESC, j.job_id ASC
            LIMIT ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| row.try_get::<i64, _>("job_id"))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let token = ClaimToken::new();
        let locked_until = (now + lease).timestamp_millis();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "UPDATE siphon_jobs SET state = 'running', attempts = attempts + 1, locked_until = ",
        );
        qb.push_bind(locked_until);
        qb.push(", claim_token = ");
        qb.push_bind(token.as_str().to_string());
        qb.push(", claimed_at = ");
        qb.push_bind(now_ms);
        qb.push(", updated_at = ");
        qb.push_bind(now_ms);
        qb.push(" WHERE state = 'pending' AND (locked_until IS NULL OR locked_until < ");
        qb.push_bind(now_ms);
        qb.push(") AND job_id IN (");
        let mut list = qb.separated(", ");
        for id in &candidates {
            list.push_bind(*id);
        }
        list.push_unseparated(")");

        let won = qb.build().execute(&self.pool).await?.rows_affected();
        if won < candidates.len() as u64 {
            debug!(
                candidates = candidates.len(),
                won, "Lost claim race for some jobs"
            );
        }
        if won == 0 {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM siphon_jobs WHERE claim_token = ? AND state = 'running' \
             ORDER BY priority DESC, job_id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(token.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_job).collect()
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    /// Mark a job done and clear its lease.
    ///
    /// A completed delete also stamps `deleted_at` on the ledger row. Upsert
    /// acks never touch the ledger. Returns false if the job was already
    /// terminal.
    pub async fn ack_job(&self, job_id: JobId) -> Result<bool> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("job {}", job_id)))?;

        let result = sqlx::query(
            r#"
            UPDATE siphon_jobs
            SET state = 'done', locked_until = NULL, claim_token = NULL,
                error_message = NULL, updated_at = ?
            WHERE job_id = ? AND state IN ('running', 'pending')
            "#,
        )
        .bind(now_millis())
        .bind(job_id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(job_id = %job_id, state = %job.state, "Ack ignored for terminal job");
            return Ok(false);
        }

        if job.is_delete() {
            self.mark_deleted(&job.content_id).await?;
        }
        Ok(true)
    }

    /// Record a failed attempt.
    ///
    /// Goes to `error` when `retryable` is false or `attempts >= max_attempts`,
    /// otherwise back to `pending`. Returns the new state, or `None` if the
    /// job was not running.
    pub async fn fail_job(
        &self,
        job_id: JobId,
        message: &str,
        retryable: bool,
        max_attempts: i64,
    ) -> Result<Option<JobState>> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("job {}", job_id)))?;

        if job.state != JobState::Running {
            debug!(job_id = %job_id, state = %job.state, "Fail ignored for non-running job");
            return Ok(None);
        }

        let next = if !retryable || job.attempts >= max_attempts {
            JobState::Error
        } else {
            JobState::Pending
        };

        let result = sqlx::query(
            r#"
            UPDATE siphon_jobs
            SET state = ?, locked_until = NULL, claim_token = NULL,
                error_message = ?, updated_at = ?
            WHERE job_id = ? AND state = 'running'
            "#,
        )
        .bind(next.as_str())
        .bind(message)
        .bind(now_millis())
        .bind(job_id.get())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(next))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM siphon_jobs WHERE job_id = ?");
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// List jobs, newest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM siphon_jobs WHERE 1=1"));
        if let Some(state) = filter.state {
            qb.push(" AND state = ");
            qb.push_bind(state.as_str());
        }
        if let Some(kind) = &filter.kind {
            qb.push(" AND source_kind = ");
            qb.push_bind(kind.clone());
        }
        qb.push(" ORDER BY job_id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Jobs of one content unit, oldest first.
    pub async fn jobs_for_content(&self, content_id: &ContentId) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM siphon_jobs WHERE content_id = ? ORDER BY job_id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(content_id.as_bytes().to_vec())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_job).collect()
    }

    /// Counts per state, overall and per kind.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT source_kind, state, COUNT(*) AS n
            FROM siphon_jobs
            GROUP BY source_kind, state
            ORDER BY source_kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in &rows {
            let kind: String = row.try_get("source_kind")?;
            let state_str: String = row.try_get("state")?;
            let state = JobState::parse(&state_str)
                .ok_or_else(|| DbError::invalid_data(format!("unknown job state '{state_str}'")))?;
            let n = row.try_get::<i64, _>("n")? as u64;

            stats.counts.add(state, n);
            match stats.by_kind.last_mut() {
                Some((last, counts)) if *last == kind => counts.add(state, n),
                _ => {
                    let mut counts = StateCounts::default();
                    counts.add(state, n);
                    stats.by_kind.push((kind, counts));
                }
            }
        }
        stats.total = stats.counts.total();

        Ok(stats)
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job> {
    let raw_id: Vec<u8> = row.try_get("content_id")?;
    let type_str: String = row.try_get("job_type")?;
    let state_str: String = row.try_get("state")?;

    Ok(Job {
        job_id: JobId::new(row.try_get("job_id")?),
        content_id: ContentId::from_slice(&raw_id)?,
        source_kind: row.try_get("source_kind")?,
        source_locator: row.try_get("source_locator")?,
        container_id: row.try_get("container_id")?,
        source_int_id: row.try_get("source_int_id")?,
        source_version: row.try_get("source_version")?,
        source_version_token: row.try_get("source_version_token")?,
        job_type: JobType::parse(&type_str)
            .ok_or_else(|| DbError::invalid_data(format!("unknown job type '{type_str}'")))?,
        state: JobState::parse(&state_str)
            .ok_or_else(|| DbError::invalid_data(format!("unknown job state '{state_str}'")))?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        locked_until: from_millis_opt(row.try_get("locked_until")?)?,
        claim_token: row.try_get("claim_token")?,
        claimed_at: from_millis_opt(row.try_get("claimed_at")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
        error_message: row.try_get("error_message")?,
    })
}
