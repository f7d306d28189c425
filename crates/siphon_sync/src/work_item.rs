//! Transportable work items handed to the downstream pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use siphon_db::{Job, JobType};
use siphon_ids::{ContentId, JobId};

pub const UPSERT_CONTENT_TYPE: &str = "application/x-siphon-content-json";
pub const DELETE_CONTENT_TYPE: &str = "application/x-embedding-job-delete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkAction {
    Upsert,
    Delete,
}

impl From<JobType> for WorkAction {
    fn from(job_type: JobType) -> Self {
        match job_type {
            JobType::Upsert => Self::Upsert,
            JobType::Delete => Self::Delete,
        }
    }
}

/// Structural metadata; the upsert-only fields stay empty for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMetadata {
    pub content_uuid: ContentId,
    pub source_kind: String,
    pub source_locator: Option<String>,
    pub container_id: Option<i64>,
    pub source_int_id: Option<i64>,
    pub source_version: Option<String>,
    pub source_version_token: Option<String>,
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_roles: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount_ref_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestor_ref_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_link: Option<String>,
}

/// One job rendered for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub action: WorkAction,
    pub job_id: JobId,
    pub collection_key: String,
    /// Content-addressed hash the pipeline dedups on.
    pub hash: String,
    pub content_type: String,
    /// Resolved content for upserts; `null` for deletes.
    pub content: Option<serde_json::Value>,
    pub size: usize,
    pub metadata: WorkMetadata,
}

impl WorkItem {
    pub fn is_delete(&self) -> bool {
        self.action == WorkAction::Delete
    }
}

/// Hex sha256 of `"<collection>:<CID>:<version or ->:<token or ->"`.
pub fn work_hash(
    collection_key: &str,
    content_id: &ContentId,
    version: Option<&str>,
    token: Option<&str>,
) -> String {
    let version = version.filter(|v| !v.is_empty()).unwrap_or("-");
    let token = token.filter(|t| !t.is_empty()).unwrap_or("-");
    let digest = Sha256::digest(format!("{collection_key}:{content_id}:{version}:{token}"));
    hex::encode(digest)
}

/// Metadata shared by both actions.
pub(crate) fn base_metadata(job: &Job) -> WorkMetadata {
    let version = job.source_version.trim();
    WorkMetadata {
        content_uuid: job.content_id,
        source_kind: job.source_kind.clone(),
        source_locator: job
            .source_locator
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string),
        container_id: job.container_id.filter(|v| *v > 0),
        source_int_id: job.source_int_id.filter(|v| *v > 0),
        source_version: (!version.is_empty()).then(|| version.to_string()),
        source_version_token: job
            .source_version_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        content_type: job.source_kind.clone(),
        title: None,
        read_roles: Vec::new(),
        mount_ref_ids: Vec::new(),
        ancestor_ref_ids: Vec::new(),
        direct_link: None,
    }
}

/// Minimal item for a delete job.
pub(crate) fn delete_item(job: &Job, collection_key: &str) -> WorkItem {
    let metadata = base_metadata(job);
    WorkItem {
        action: WorkAction::Delete,
        job_id: job.job_id,
        collection_key: collection_key.to_string(),
        hash: work_hash(
            collection_key,
            &job.content_id,
            metadata.source_version.as_deref(),
            metadata.source_version_token.as_deref(),
        ),
        content_type: DELETE_CONTENT_TYPE.to_string(),
        content: None,
        size: 0,
        metadata,
    }
}
