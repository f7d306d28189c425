//! Row types for the seen ledger and the job table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siphon_ids::{ContentId, JobId};

// ============================================================================
// Seen Ledger
// ============================================================================

/// Last version of a content unit the system has observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub content_id: ContentId,
    pub source_system: String,
    pub source_kind: String,
    pub source_locator: String,
    pub container_id: Option<i64>,
    pub source_int_id: Option<i64>,
    pub last_seen_version: String,
    pub last_seen_version_token: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    /// Set once the unit is detected absent from the source.
    pub missing_since: Option<DateTime<Utc>>,
    pub delete_job_id: Option<JobId>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SeenRecord {
    /// Present in the source and not on its way out.
    pub fn is_live(&self) -> bool {
        self.missing_since.is_none() && self.deleted_at.is_none()
    }
}

/// Input for [`crate::SiphonDb::upsert_seen`].
#[derive(Debug, Clone)]
pub struct SeenEntry {
    pub content_id: ContentId,
    pub source_system: String,
    pub source_kind: String,
    pub source_locator: String,
    pub container_id: Option<i64>,
    pub source_int_id: Option<i64>,
    pub version: String,
    pub version_token: Option<String>,
}

// ============================================================================
// Job Table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Upsert,
    Delete,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "upsert" => Some(Self::Upsert),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job lifecycle.
///
/// ```text
/// pending --claim--> running --ack--> done
/// running --lease expiry / retryable fail--> pending
/// running --fail (no retry or attempts exhausted)--> error
/// pending --newer version / kind disabled--> superseded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Error,
    Superseded,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        Self::Pending,
        Self::Running,
        Self::Done,
        Self::Error,
        Self::Superseded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }

    /// Terminal rows are never reopened.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Superseded)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub content_id: ContentId,
    pub source_kind: String,
    pub source_locator: Option<String>,
    pub container_id: Option<i64>,
    pub source_int_id: Option<i64>,
    pub source_version: String,
    pub source_version_token: Option<String>,
    pub job_type: JobType,
    pub state: JobState,
    pub priority: i64,
    pub attempts: i64,
    pub locked_until: Option<DateTime<Utc>>,
    pub claim_token: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn is_delete(&self) -> bool {
        self.job_type == JobType::Delete
    }
}

/// Input for inserting a job at one version of one content unit.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub content_id: ContentId,
    pub source_kind: String,
    pub source_locator: Option<String>,
    pub container_id: Option<i64>,
    pub source_int_id: Option<i64>,
    pub source_version: String,
    pub source_version_token: Option<String>,
    pub priority: i64,
}

/// Outcome of an insert-or-ignore on the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Created(JobId),
    /// A row for the same `(content_id, source_version, job_type)` already exists.
    Duplicate,
}

impl EnqueueResult {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

/// Result of returning expired leases to the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleasedLeases {
    pub requeued: u64,
    pub errored: u64,
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub running: u64,
    pub done: u64,
    pub error: u64,
    pub superseded: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.done + self.error + self.superseded
    }

    pub(crate) fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Pending => self.pending += count,
            JobState::Running => self.running += count,
            JobState::Done => self.done += count,
            JobState::Error => self.error += count,
            JobState::Superseded => self.superseded += count,
        }
    }
}

/// Queue statistics, overall and per kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub counts: StateCounts,
    pub by_kind: Vec<(String, StateCounts)>,
}

/// Operator override of a kind's enabled flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindSetting {
    pub kind: String,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}
