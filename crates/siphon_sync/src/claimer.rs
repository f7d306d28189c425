//! Job claimer: lease jobs, build work items, record outcomes.

use crate::config::ClaimConfig;
use crate::error::Result;
use crate::provider::{ContentProvider, NoTree, ObjectTreeResolver, SourceRef};
use crate::work_item::{base_metadata, delete_item, work_hash, WorkAction, WorkItem, UPSERT_CONTENT_TYPE};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use siphon_db::{Job, JobState, JobType, SiphonDb};
use siphon_ids::JobId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Result of turning one claimed job into a work item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Ready(WorkItem),
    /// Benign miss (no provider, no content yet); retried later.
    Skip(String),
    Error { message: String, retryable: bool },
}

/// Failure reported by a [`WorkSink`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SinkError {
    pub message: String,
    pub retryable: bool,
}

impl SinkError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Downstream consumer of work items.
#[async_trait]
pub trait WorkSink: Send + Sync {
    async fn deliver(&self, item: &WorkItem) -> std::result::Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClaimReport {
    pub claimed: u64,
    pub acked: u64,
    pub failed: u64,
    /// Claimed jobs that could not be built into an item.
    pub skipped: u64,
}

impl ClaimReport {
    fn merge(&mut self, other: ClaimReport) {
        self.claimed += other.claimed;
        self.acked += other.acked;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

impl fmt::Display for ClaimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "claim done - claimed:{} acked:{} failed:{} skipped:{}",
            self.claimed, self.acked, self.failed, self.skipped
        )
    }
}

pub struct JobClaimer {
    db: SiphonDb,
    providers: HashMap<String, Arc<dyn ContentProvider>>,
    tree: Arc<dyn ObjectTreeResolver>,
    config: ClaimConfig,
}

impl JobClaimer {
    pub fn new(db: SiphonDb, config: ClaimConfig) -> Self {
        Self {
            db,
            providers: HashMap::new(),
            tree: Arc::new(NoTree),
            config,
        }
    }

    /// Register a provider for its kind; a later one for the same kind wins.
    pub fn with_provider(mut self, provider: Arc<dyn ContentProvider>) -> Self {
        self.providers
            .insert(provider.source_kind().to_string(), provider);
        self
    }

    pub fn with_tree(mut self, tree: Arc<dyn ObjectTreeResolver>) -> Self {
        self.tree = tree;
        self
    }

    pub fn config(&self) -> &ClaimConfig {
        &self.config
    }

    /// Lease up to `limit` jobs, after returning expired leases to the pool.
    pub async fn claim(&self, limit: i64) -> Result<Vec<Job>> {
        let now = Utc::now();
        self.db
            .release_expired_leases(now, self.config.max_attempts)
            .await?;
        let jobs = self.db.claim_jobs(limit, self.config.lease(), now).await?;
        if !jobs.is_empty() {
            debug!(count = jobs.len(), "Jobs claimed");
        }
        Ok(jobs)
    }

    /// Resolve a claimed job into a transportable work item.
    pub async fn build_work_item(&self, job: &Job) -> ItemOutcome {
        let kind = job.source_kind.trim();
        if kind.is_empty() {
            return ItemOutcome::Error {
                message: "job has no source kind".into(),
                retryable: false,
            };
        }

        if job.job_type == JobType::Delete {
            return ItemOutcome::Ready(delete_item(job, &self.config.collection_key));
        }

        let mut metadata = base_metadata(job);
        let Some(locator) = metadata.source_locator.clone() else {
            return ItemOutcome::Error {
                message: "upsert job has no source locator".into(),
                retryable: false,
            };
        };

        let Some(provider) = self.providers.get(kind).filter(|p| p.is_active()) else {
            return ItemOutcome::Skip(format!("missing provider for kind '{kind}'"));
        };

        let at = SourceRef {
            locator: &locator,
            container_id: metadata.container_id,
            source_int_id: metadata.source_int_id,
        };

        let payload = match provider.fetch_content(at).await {
            Ok(Some(payload)) => payload,
            Ok(None) => return ItemOutcome::Skip("missing payload".into()),
            Err(e) => {
                return ItemOutcome::Error {
                    message: format!("fetch content: {e}"),
                    retryable: true,
                }
            }
        };

        let title = payload.title.trim();
        if !title.is_empty() {
            metadata.title = Some(title.to_string());
        }

        metadata.read_roles = match provider.fetch_read_roles(at).await {
            Ok(roles) => roles,
            Err(e) => {
                return ItemOutcome::Error {
                    message: format!("fetch read roles: {e}"),
                    retryable: true,
                }
            }
        };

        if let Some(container_id) = metadata.container_id {
            let tree = async {
                let mounts = self.tree.mount_ref_ids(container_id).await?;
                let ancestors = self.tree.ancestor_ref_ids(container_id).await?;
                Ok::<_, crate::error::ProviderError>((mounts, ancestors))
            };
            match tree.await {
                Ok((mounts, ancestors)) => {
                    metadata.mount_ref_ids = mounts;
                    metadata.ancestor_ref_ids = ancestors;
                }
                Err(e) => {
                    return ItemOutcome::Error {
                        message: format!("resolve object tree: {e}"),
                        retryable: true,
                    }
                }
            }
        }

        metadata.direct_link = match provider.direct_link(at).await {
            Ok(link) => link.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()),
            Err(e) => {
                debug!(job_id = %job.job_id, error = %e, "Direct link unavailable");
                None
            }
        };

        let content = json!({
            "system": provider.source_system(),
            "kind": kind,
            "locator": locator,
            "content_uuid": job.content_id,
            "container_id": metadata.container_id,
            "source_int_id": metadata.source_int_id,
            "version": metadata.source_version,
            "version_token": metadata.source_version_token,
            "read_roles": metadata.read_roles,
            "mount_ref_ids": metadata.mount_ref_ids,
            "ancestor_ref_ids": metadata.ancestor_ref_ids,
            "direct_link": metadata.direct_link,
            "content": payload,
        });
        let size = serde_json::to_vec(&content).map(|bytes| bytes.len()).unwrap_or(0);

        ItemOutcome::Ready(WorkItem {
            action: WorkAction::Upsert,
            job_id: job.job_id,
            collection_key: self.config.collection_key.clone(),
            hash: work_hash(
                &self.config.collection_key,
                &job.content_id,
                metadata.source_version.as_deref(),
                metadata.source_version_token.as_deref(),
            ),
            content_type: UPSERT_CONTENT_TYPE.to_string(),
            content: Some(content),
            size,
            metadata,
        })
    }

    /// Claim and build items. Jobs that cannot be built are failed right
    /// away, never left leased.
    pub async fn extract(&self, limit: i64) -> Result<Vec<WorkItem>> {
        let mut report = ClaimReport::default();
        self.extract_into(limit, &mut report).await
    }

    async fn extract_into(&self, limit: i64, report: &mut ClaimReport) -> Result<Vec<WorkItem>> {
        let jobs = self.claim(limit).await?;
        report.claimed += jobs.len() as u64;

        let mut items = Vec::with_capacity(jobs.len());
        for job in &jobs {
            match self.build_work_item(job).await {
                ItemOutcome::Ready(item) => items.push(item),
                ItemOutcome::Skip(reason) => {
                    debug!(job_id = %job.job_id, reason = %reason, "Job skipped");
                    self.fail(job.job_id, &reason, true).await?;
                    report.skipped += 1;
                }
                ItemOutcome::Error { message, retryable } => {
                    warn!(job_id = %job.job_id, error = %message, retryable, "Job could not be built");
                    self.fail(job.job_id, &message, retryable).await?;
                    report.skipped += 1;
                }
            }
        }
        Ok(items)
    }

    /// Mark a job done. Whether it was a delete is read from the job row.
    pub async fn ack(&self, job_id: JobId) -> Result<bool> {
        Ok(self.db.ack_job(job_id).await?)
    }

    /// Record a failure; returns the job's new state, if it changed.
    pub async fn fail(&self, job_id: JobId, message: &str, retryable: bool) -> Result<Option<JobState>> {
        let message = truncate_chars(message, self.config.max_error_len);
        let next = self
            .db
            .fail_job(job_id, &message, retryable, self.config.max_attempts)
            .await?;
        if next == Some(JobState::Error) {
            warn!(job_id = %job_id, error = %message, "Job moved to error");
        }
        Ok(next)
    }

    /// One claim cycle: extract, deliver to the sink, ack or fail each item.
    pub async fn run_once(&self, sink: &dyn WorkSink, limit: i64) -> Result<ClaimReport> {
        let mut report = ClaimReport::default();
        let items = self.extract_into(limit, &mut report).await?;

        for item in &items {
            match sink.deliver(item).await {
                Ok(()) => {
                    if self.ack(item.job_id).await? {
                        report.acked += 1;
                    }
                }
                Err(e) => {
                    self.fail(item.job_id, &e.message, e.retryable).await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Repeat [`JobClaimer::run_once`] until nothing is claimable.
    pub async fn drain(&self, sink: &dyn WorkSink, limit: i64) -> Result<ClaimReport> {
        let mut total = ClaimReport::default();
        loop {
            let report = self.run_once(sink, limit).await?;
            if report.claimed == 0 {
                break;
            }
            total.merge(report);
        }
        info!(
            claimed = total.claimed,
            acked = total.acked,
            failed = total.failed,
            skipped = total.skipped,
            "{}",
            total
        );
        Ok(total)
    }
}

fn truncate_chars(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
