//! Shared fixtures for siphon_sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use siphon_db::{Job, JobFilter, JobState, JobType, SiphonDb};
use siphon_sync::{
    ContentBatch, ContentCursor, ContentPayload, ContentProvider, ContentUnit, ProviderError,
    SinkError, SourceRef, SyncConfig, SyncEngine, WorkItem, WorkSink,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const SYSTEM: &str = "lms";
pub const KIND: &str = "wiki_page";

/// In-memory provider: a mutable set of units plus switches for failure paths.
pub struct MemoryProvider {
    name: String,
    kind: String,
    /// Kind written on emitted units, when it differs from the provider's.
    unit_kind: Option<String>,
    units: Mutex<BTreeMap<String, ContentUnit>>,
    bodies: Mutex<BTreeMap<String, String>>,
    missing: Mutex<HashSet<i64>>,
    fail_changed: AtomicBool,
    fail_content: AtomicBool,
    active: AtomicBool,
}

impl MemoryProvider {
    pub fn new(kind: &str) -> Self {
        Self {
            name: format!("{kind}s"),
            kind: kind.to_string(),
            unit_kind: None,
            units: Mutex::new(BTreeMap::new()),
            bodies: Mutex::new(BTreeMap::new()),
            missing: Mutex::new(HashSet::new()),
            fail_changed: AtomicBool::new(false),
            fail_content: AtomicBool::new(false),
            active: AtomicBool::new(true),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn emitting_kind(mut self, kind: &str) -> Self {
        self.unit_kind = Some(kind.to_string());
        self
    }

    pub fn locator(&self, int_id: i64) -> String {
        format!("{}:1:{int_id}", self.kind)
    }

    /// Add or change a unit; `changed_at` doubles as its version.
    pub fn put(&self, int_id: i64, changed_at: &str, token: Option<&str>) {
        let locator = self.locator(int_id);
        let unit = ContentUnit {
            source_system: SYSTEM.to_string(),
            source_kind: self.unit_kind.clone().unwrap_or_else(|| self.kind.clone()),
            source_locator: locator.clone(),
            container_id: Some(1),
            source_int_id: Some(int_id),
            title: Some(format!("Page {int_id}")),
            description: None,
            content_updated_at: Some(changed_at.to_string()),
            version_token: token.map(str::to_string),
        };
        self.units.lock().unwrap().insert(locator.clone(), unit);
        self.bodies
            .lock()
            .unwrap()
            .insert(locator, format!("<p>page {int_id} at {changed_at}</p>"));
        self.missing.lock().unwrap().remove(&int_id);
    }

    /// Drop a unit from the source and report it as missing.
    pub fn remove(&self, int_id: i64) {
        let locator = self.locator(int_id);
        self.units.lock().unwrap().remove(&locator);
        self.bodies.lock().unwrap().remove(&locator);
        self.missing.lock().unwrap().insert(int_id);
    }

    pub fn fail_changed(&self, fail: bool) {
        self.fail_changed.store(fail, Ordering::SeqCst);
    }

    pub fn fail_content(&self, fail: bool) {
        self.fail_content.store(fail, Ordering::SeqCst);
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn content_id(&self, int_id: i64) -> siphon_ids::ContentId {
        siphon_ids::ContentId::from_triple(SYSTEM, &self.kind, &self.locator(int_id))
    }
}

#[async_trait]
impl ContentProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_system(&self) -> &str {
        SYSTEM
    }

    fn source_kind(&self) -> &str {
        &self.kind
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn fetch_changed(
        &self,
        cursor: &ContentCursor,
        limit: usize,
    ) -> Result<ContentBatch, ProviderError> {
        if self.fail_changed.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("source offline".into()));
        }

        let mut units: Vec<ContentUnit> = self
            .units
            .lock()
            .unwrap()
            .values()
            .filter(|u| {
                let at = u.content_updated_at.as_deref().unwrap_or_default();
                cursor.admits(at, u.source_int_id.unwrap_or(0))
            })
            .cloned()
            .collect();
        units.sort_by(|a, b| {
            (a.content_updated_at.as_deref(), a.source_int_id)
                .cmp(&(b.content_updated_at.as_deref(), b.source_int_id))
        });
        units.truncate(limit);

        let mut next = cursor.clone();
        for u in &units {
            next.advance(
                u.content_updated_at.as_deref().unwrap_or_default(),
                u.source_int_id.unwrap_or(0),
            );
        }
        Ok(ContentBatch {
            units,
            next_cursor: next,
        })
    }

    async fn fetch_missing_ids(&self, limit: usize) -> Result<Vec<i64>, ProviderError> {
        let mut ids: Vec<i64> = self.missing.lock().unwrap().iter().copied().collect();
        ids.sort_unstable();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn fetch_content(&self, at: SourceRef<'_>) -> Result<Option<ContentPayload>, ProviderError> {
        if self.fail_content.load(Ordering::SeqCst) {
            return Err(ProviderError::Query("content query failed".into()));
        }
        let body = self.bodies.lock().unwrap().get(at.locator).cloned();
        Ok(body.map(|content| ContentPayload {
            title: format!("Page {}", at.source_int_id.unwrap_or(0)),
            content,
            extra: serde_json::Map::new(),
        }))
    }

    async fn fetch_read_roles(&self, _at: SourceRef<'_>) -> Result<Vec<i64>, ProviderError> {
        Ok(vec![2, 4])
    }

    async fn direct_link(&self, at: SourceRef<'_>) -> Result<Option<String>, ProviderError> {
        Ok(at.source_int_id.map(|id| format!("goto.php/wiki/wpage_{id}_110")))
    }
}

/// Sink that records what it was given and can be told to refuse.
#[derive(Default)]
pub struct RecordingSink {
    pub items: Mutex<Vec<WorkItem>>,
    refuse: Mutex<Option<SinkError>>,
}

impl RecordingSink {
    pub fn refusing(error: SinkError) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            refuse: Mutex::new(Some(error)),
        }
    }

    pub fn delivered(&self) -> Vec<WorkItem> {
        self.items.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkSink for RecordingSink {
    async fn deliver(&self, item: &WorkItem) -> Result<(), SinkError> {
        if let Some(error) = self.refuse.lock().unwrap().clone() {
            return Err(error);
        }
        self.items.lock().unwrap().push(item.clone());
        Ok(())
    }
}

/// Sync config with the test kind enabled and no run gate.
pub fn sync_config() -> SyncConfig {
    SyncConfig {
        min_interval_secs: 0,
        kinds: BTreeMap::from([(KIND.to_string(), true)]),
        ..SyncConfig::default()
    }
}

pub async fn engine_with(provider: Arc<MemoryProvider>) -> (SiphonDb, SyncEngine) {
    let db = SiphonDb::open_in_memory().await.unwrap();
    let engine = SyncEngine::new(db.clone(), sync_config()).with_provider(provider);
    (db, engine)
}

pub async fn jobs(db: &SiphonDb, state: Option<JobState>) -> Vec<Job> {
    let mut jobs = db
        .list_jobs(&JobFilter {
            state,
            ..JobFilter::default()
        })
        .await
        .unwrap();
    jobs.reverse();
    jobs
}

pub async fn count(db: &SiphonDb, job_type: JobType, state: JobState) -> usize {
    jobs(db, Some(state))
        .await
        .iter()
        .filter(|j| j.job_type == job_type)
        .count()
}
