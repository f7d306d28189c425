//! Typed configuration for the sync engine and job claimers.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiphonConfig {
    /// Path to the SQLite database; `<home>/siphon.db` when unset
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// JSON snapshot of the source for the manifest provider
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub claim: ClaimConfig,
}

/// Sync engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minimum seconds between two engine runs
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,

    /// Page size for change scans
    #[serde(default = "default_changed_batch")]
    pub changed_batch: usize,

    /// Missing ids requested per delete scan
    #[serde(default = "default_delete_batch")]
    pub delete_batch: usize,

    /// Ledger page size when tearing down a disabled kind
    #[serde(default = "default_bulk_delete_batch")]
    pub bulk_delete_batch: usize,

    /// Ids per ledger lookup query
    #[serde(default = "default_lookup_chunk")]
    pub lookup_chunk: usize,

    /// Priority of enqueued jobs
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Default enabled flag per kind; operator overrides win
    #[serde(default)]
    pub kinds: BTreeMap<String, bool>,
}

fn default_min_interval() -> u64 {
    900
}

fn default_changed_batch() -> usize {
    5000
}

fn default_delete_batch() -> usize {
    2000
}

fn default_bulk_delete_batch() -> usize {
    5000
}

fn default_lookup_chunk() -> usize {
    500
}

fn default_priority() -> i64 {
    1
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval(),
            changed_batch: default_changed_batch(),
            delete_batch: default_delete_batch(),
            bulk_delete_batch: default_bulk_delete_batch(),
            lookup_chunk: default_lookup_chunk(),
            priority: default_priority(),
            kinds: BTreeMap::new(),
        }
    }
}

/// Job claimer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// Collection name mixed into work item hashes
    #[serde(default = "default_collection_key")]
    pub collection_key: String,

    /// Jobs leased per claim
    #[serde(default = "default_claim_limit")]
    pub claim_limit: i64,

    /// Lease duration in seconds
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Claims allowed before a failing job goes to error
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,

    /// Stored error messages are cut to this many characters
    #[serde(default = "default_max_error_len")]
    pub max_error_len: usize,
}

const MAX_LEASE_SECS: u64 = 86_400;

fn default_collection_key() -> String {
    "lms".to_string()
}

fn default_claim_limit() -> i64 {
    5
}

fn default_lease_secs() -> u64 {
    600
}

fn default_max_attempts() -> i64 {
    5
}

fn default_max_error_len() -> usize {
    4000
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            collection_key: default_collection_key(),
            claim_limit: default_claim_limit(),
            lease_secs: default_lease_secs(),
            max_attempts: default_max_attempts(),
            max_error_len: default_max_error_len(),
        }
    }
}

impl ClaimConfig {
    /// Lease as a duration, capped at one day.
    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.min(MAX_LEASE_SECS) as i64)
    }
}

impl SiphonConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: SiphonConfig =
            toml::from_str(&content).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if sync.changed_batch == 0 || sync.delete_batch == 0 || sync.bulk_delete_batch == 0 {
            return Err(SyncError::Config("batch sizes must be positive".into()));
        }
        if sync.lookup_chunk == 0 || sync.lookup_chunk > siphon_db::MAX_LOOKUP_CHUNK {
            return Err(SyncError::Config(format!(
                "lookup_chunk must be between 1 and {}",
                siphon_db::MAX_LOOKUP_CHUNK
            )));
        }
        if self.claim.claim_limit <= 0 || self.claim.max_attempts <= 0 {
            return Err(SyncError::Config(
                "claim_limit and max_attempts must be positive".into(),
            ));
        }
        if self.claim.lease_secs == 0 {
            return Err(SyncError::Config("lease_secs must be positive".into()));
        }
        if self.claim.collection_key.trim().is_empty() {
            return Err(SyncError::Config("collection_key must not be empty".into()));
        }
        Ok(())
    }
}
