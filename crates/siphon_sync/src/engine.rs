//! Sync engine: diff provider pages against the seen ledger and enqueue jobs.

use crate::config::SyncConfig;
use crate::cursor::ContentCursor;
use crate::error::Result;
use crate::keys;
use crate::provider::{ContentProvider, ContentUnit};
use chrono::{DateTime, Utc};
use serde::Serialize;
use siphon_db::{EnqueueResult, JobState, JobType, NewJob, SeenEntry, SeenRecord, SiphonDb};
use siphon_ids::ContentId;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to one unit of a change page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// A new upsert job was created.
    Enqueued,
    /// Recorded version matches, a live job for this version already exists,
    /// or the pipeline already holds exactly this version.
    Unchanged,
    /// The pipeline does not hold this version and a terminal row for it
    /// blocks a new job. The ledger is left as it was.
    Suppressed,
    Failed(String),
}

/// Per-scan tally of [`UnitOutcome`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub enqueued: u64,
    pub unchanged: u64,
    pub suppressed: u64,
    pub failed: u64,
}

impl ScanStats {
    fn record(&mut self, outcome: &UnitOutcome) {
        match outcome {
            UnitOutcome::Enqueued => self.enqueued += 1,
            UnitOutcome::Unchanged => self.unchanged += 1,
            UnitOutcome::Suppressed => self.suppressed += 1,
            UnitOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Per-scan tally of delete enqueues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteStats {
    pub enqueued: u64,
    pub failed: u64,
}

/// Result of [`SyncEngine::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// The minimum interval had not elapsed; nothing was done.
    pub skipped: bool,
    pub changed: u64,
    pub deleted: u64,
    /// Also counted in `errors`.
    pub suppressed: u64,
    pub providers: u64,
    pub errors: u64,
    pub toggles: u64,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped {
            return write!(f, "enqueue skipped - interval not elapsed");
        }
        write!(
            f,
            "enqueue done - changed:{} deleted:{} suppressed:{} providers:{} errors:{} toggles:{}",
            self.changed, self.deleted, self.suppressed, self.providers, self.errors, self.toggles
        )
    }
}

/// Orchestrates change scans, delete scans and kind transitions.
pub struct SyncEngine {
    pub(crate) db: SiphonDb,
    pub(crate) providers: Vec<Arc<dyn ContentProvider>>,
    pub(crate) config: SyncConfig,
}

impl SyncEngine {
    pub fn new(db: SiphonDb, config: SyncConfig) -> Self {
        Self {
            db,
            providers: Vec::new(),
            config,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ContentProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn add_provider(&mut self, provider: Arc<dyn ContentProvider>) {
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[Arc<dyn ContentProvider>] {
        &self.providers
    }

    pub fn db(&self) -> &SiphonDb {
        &self.db
    }

    /// One scheduled run.
    ///
    /// Gated by the minimum interval unless `force` is set. Provider failures
    /// are counted, never propagated; store failures abort the run.
    pub async fn run(&self, force: bool) -> Result<RunReport> {
        let now = Utc::now();
        if !force && !self.should_run(now).await? {
            debug!("Sync skipped, minimum interval not elapsed");
            return Ok(RunReport {
                skipped: true,
                ..RunReport::default()
            });
        }

        let mut report = RunReport {
            toggles: self.sync_kind_transitions().await?,
            ..RunReport::default()
        };

        for provider in &self.providers {
            let name = provider.name();
            if !provider.is_active() {
                debug!(provider = name, "Provider inactive");
                continue;
            }
            if !self.is_kind_enabled(provider.source_kind()).await? {
                debug!(provider = name, kind = provider.source_kind(), "Kind disabled");
                continue;
            }
            report.providers += 1;

            match self.process_changed(provider.as_ref()).await {
                Ok(stats) => {
                    report.changed += stats.enqueued;
                    report.suppressed += stats.suppressed;
                    report.errors += stats.failed + stats.suppressed;
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(provider = name, error = %e, "Change scan failed");
                }
            }

            match self.process_deletes(provider.as_ref()).await {
                Ok(stats) => {
                    report.deleted += stats.enqueued;
                    report.errors += stats.failed;
                }
                Err(e) => {
                    report.errors += 1;
                    warn!(provider = name, error = %e, "Delete scan failed");
                }
            }
        }

        self.db.set_state(keys::LAST_RUN_AT, &now.to_rfc3339()).await?;
        info!(
            changed = report.changed,
            deleted = report.deleted,
            suppressed = report.suppressed,
            providers = report.providers,
            errors = report.errors,
            toggles = report.toggles,
            "{}",
            report
        );
        Ok(report)
    }

    /// True if no run was recorded or the minimum interval has passed.
    pub async fn should_run(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(raw) = self.db.get_state(keys::LAST_RUN_AT).await? else {
            return Ok(true);
        };
        let Ok(last) = DateTime::parse_from_rfc3339(raw.trim()) else {
            warn!(value = %raw, "Unreadable last run timestamp, running");
            return Ok(true);
        };
        let elapsed = now.signed_duration_since(last.with_timezone(&Utc));
        let interval = i64::try_from(self.config.min_interval_secs).unwrap_or(i64::MAX);
        Ok(elapsed.num_seconds() >= interval || elapsed.num_seconds() < 0)
    }

    /// Operator override, else configured default, else disabled.
    pub async fn is_kind_enabled(&self, kind: &str) -> Result<bool> {
        if let Some(enabled) = self.db.kind_override(kind).await? {
            return Ok(enabled);
        }
        Ok(self.config.kinds.get(kind).copied().unwrap_or(false))
    }

    /// Read one change page and enqueue upserts for every unit that moved.
    ///
    /// The cursor is persisted only when every unit was handled; a failed
    /// unit holds it so the page is read again next run.
    ///
    /// Identity, ledger row and job are keyed on the provider's system and
    /// kind, the same keys delete detection and kind toggles look up.
    pub async fn process_changed(&self, provider: &dyn ContentProvider) -> Result<ScanStats> {
        let system = provider.source_system();
        let kind = provider.source_kind();
        let key = keys::provider_cursor(provider.name(), system, kind);
        let stored = self.db.get_state(&key).await?;
        let cursor = ContentCursor::parse(stored.as_deref().unwrap_or(""));

        let batch = provider
            .fetch_changed(&cursor, self.config.changed_batch)
            .await?;

        let mut stats = ScanStats::default();
        if !batch.units.is_empty() {
            let ids: Vec<ContentId> = batch
                .units
                .iter()
                .map(|unit| ContentId::from_triple(system, kind, &unit.source_locator))
                .collect();
            let seen = self
                .db
                .load_seen_by_ids(&ids, self.config.lookup_chunk)
                .await?;

            for (unit, id) in batch.units.iter().zip(&ids) {
                if unit.source_kind != kind || unit.source_system != system {
                    debug!(
                        provider = provider.name(),
                        unit_kind = %unit.source_kind,
                        unit_system = %unit.source_system,
                        "Unit tagged differently from its provider, keyed on the provider"
                    );
                }
                let outcome = self.apply_unit(provider, unit, *id, seen.get(id)).await;
                if let UnitOutcome::Failed(reason) = &outcome {
                    warn!(
                        provider = provider.name(),
                        locator = %unit.source_locator,
                        error = %reason,
                        "Unit failed"
                    );
                }
                stats.record(&outcome);
            }
        }

        if stats.failed > 0 {
            warn!(
                provider = provider.name(),
                cursor = %cursor,
                failed = stats.failed,
                "Cursor held back after unit failures"
            );
        } else {
            let next = std::cmp::max(cursor.clone(), batch.next_cursor);
            if stored.is_none() || next != cursor {
                self.db.set_state(&key, &next.to_string()).await?;
            }
        }

        debug!(
            provider = provider.name(),
            enqueued = stats.enqueued,
            unchanged = stats.unchanged,
            "Change scan finished"
        );
        Ok(stats)
    }

    async fn apply_unit(
        &self,
        provider: &dyn ContentProvider,
        unit: &ContentUnit,
        content_id: ContentId,
        seen: Option<&SeenRecord>,
    ) -> UnitOutcome {
        let version = normalize_version(unit.content_updated_at.as_deref());
        let token = normalize_token(unit.version_token.as_deref());

        let reappeared = match seen {
            Some(record) if record.is_live() => {
                if version_matches(record, &version, token.as_deref()) {
                    return UnitOutcome::Unchanged;
                }
                false
            }
            Some(_) => true,
            None => false,
        };

        let change = UnitChange {
            unit,
            content_id,
            version,
            token,
            reappeared,
        };
        match self.enqueue_upsert(provider, change).await {
            Ok(outcome) => outcome,
            Err(e) => UnitOutcome::Failed(e.to_string()),
        }
    }

    /// Supersede older pending upserts, insert the new one, then record the
    /// version in the ledger.
    ///
    /// The ledger is written last: if the process dies in between, the next
    /// scan still sees a difference and retries. A suppressed change leaves
    /// the ledger untouched. A unit that came back retires its pending delete
    /// before the ledger marks it live again.
    async fn enqueue_upsert(
        &self,
        provider: &dyn ContentProvider,
        change: UnitChange<'_>,
    ) -> Result<UnitOutcome> {
        let UnitChange {
            unit,
            content_id,
            version,
            token,
            reappeared,
        } = change;
        let kind = provider.source_kind();
        let container_id = positive(unit.container_id);
        let source_int_id = positive(unit.source_int_id);

        let superseded = self
            .db
            .supersede_pending_upserts(&content_id, kind, Some(&version))
            .await?;

        let job = NewJob {
            content_id,
            source_kind: kind.to_string(),
            source_locator: Some(unit.source_locator.clone()),
            container_id,
            source_int_id,
            source_version: version.clone(),
            source_version_token: token.clone(),
            priority: self.config.priority,
        };
        let result = self.db.insert_upsert_job(&job).await?;

        let outcome = match result {
            EnqueueResult::Created(job_id) => {
                debug!(
                    job_id = %job_id,
                    content_id = %content_id,
                    version = %version,
                    superseded,
                    "Upsert enqueued"
                );
                UnitOutcome::Enqueued
            }
            EnqueueResult::Duplicate => {
                self.classify_duplicate(&content_id, &version, token.as_deref())
                    .await?
            }
        };
        if outcome == UnitOutcome::Suppressed {
            return Ok(outcome);
        }

        if reappeared {
            let retired = self.db.supersede_pending_deletes(&content_id).await?;
            if retired > 0 {
                debug!(content_id = %content_id, retired, "Unit is back, pending delete retired");
            }
        }

        self.db
            .upsert_seen(&SeenEntry {
                content_id,
                source_system: provider.source_system().to_string(),
                source_kind: kind.to_string(),
                source_locator: unit.source_locator.clone(),
                container_id,
                source_int_id,
                version,
                version_token: token,
            })
            .await?;

        Ok(outcome)
    }

    /// Decide what an ignored insert means.
    ///
    /// A pending or running upsert at this version will carry the change. A
    /// terminal one only counts if it is also the last job that reached the
    /// pipeline, with a matching token; anything else means the pipeline holds
    /// something else and no job can be inserted for this version.
    async fn classify_duplicate(
        &self,
        content_id: &ContentId,
        version: &str,
        token: Option<&str>,
    ) -> Result<UnitOutcome> {
        let jobs = self.db.jobs_for_content(content_id).await?;
        let Some(existing) = jobs
            .iter()
            .find(|job| job.job_type == JobType::Upsert && job.source_version == version)
        else {
            return Ok(UnitOutcome::Unchanged);
        };
        if !existing.state.is_terminal() {
            return Ok(UnitOutcome::Unchanged);
        }

        let last_delivered = jobs
            .iter()
            .filter(|job| matches!(job.state, JobState::Done | JobState::Running))
            .max_by_key(|job| job.job_id);
        let indexed = last_delivered.is_some_and(|last| {
            last.job_id == existing.job_id
                && last.state == JobState::Done
                && token_matches(last.source_version_token.as_deref(), token)
        });
        if indexed {
            debug!(content_id = %content_id, version = %version, "Version already indexed");
            return Ok(UnitOutcome::Unchanged);
        }

        warn!(
            content_id = %content_id,
            version = %version,
            job_id = %existing.job_id,
            state = %existing.state,
            last_delivered = ?last_delivered.map(|job| (job.job_id, job.job_type)),
            "Change suppressed: pipeline does not hold this version and a job for it already exists"
        );
        Ok(UnitOutcome::Suppressed)
    }

    /// Enqueue deletes for ids the provider reports as gone.
    ///
    /// A record whose delete could not be written is counted as failed; the
    /// next scan reports it missing again.
    pub async fn process_deletes(&self, provider: &dyn ContentProvider) -> Result<DeleteStats> {
        let mut missing = provider.fetch_missing_ids(self.config.delete_batch).await?;
        missing.retain(|id| *id > 0);
        missing.sort_unstable();
        missing.dedup();
        if missing.is_empty() {
            return Ok(DeleteStats::default());
        }

        let records = self
            .db
            .find_live_by_int_ids(
                provider.source_system(),
                provider.source_kind(),
                &missing,
                self.config.lookup_chunk,
            )
            .await?;

        let mut stats = DeleteStats::default();
        for record in &records {
            match self.enqueue_delete(record).await {
                Ok(true) => stats.enqueued += 1,
                Ok(false) => {}
                Err(e) => {
                    stats.failed += 1;
                    warn!(
                        provider = provider.name(),
                        content_id = %record.content_id,
                        error = %e,
                        "Delete enqueue failed"
                    );
                }
            }
        }

        if stats.enqueued > 0 {
            info!(provider = provider.name(), deleted = stats.enqueued, "Deletes enqueued");
        }
        Ok(stats)
    }

    /// Retire pending upserts, insert a delete at the last known version and
    /// mark the record missing. Returns true if a new job was created.
    pub(crate) async fn enqueue_delete(&self, record: &SeenRecord) -> Result<bool> {
        let kind = record.source_kind.as_str();
        self.db
            .supersede_pending_upserts(&record.content_id, kind, None)
            .await?;

        let version = normalize_version(Some(&record.last_seen_version));
        let job = NewJob {
            content_id: record.content_id,
            source_kind: kind.to_string(),
            source_locator: Some(record.source_locator.clone()),
            container_id: record.container_id,
            source_int_id: record.source_int_id,
            source_version: version,
            source_version_token: normalize_token(record.last_seen_version_token.as_deref()),
            priority: self.config.priority,
        };
        let result = self.db.insert_delete_job(&job).await?;
        self.db.mark_missing(&record.content_id).await?;

        Ok(result.is_created())
    }
}

/// Trimmed version string; absent or blank means "now".
pub(crate) fn normalize_version(raw: Option<&str>) -> String {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(version) => version.to_string(),
        None => Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

/// Trimmed token; blank is no token.
pub(crate) fn normalize_token(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

fn positive(id: Option<i64>) -> Option<i64> {
    id.filter(|v| *v > 0)
}

/// Inputs of one unit that needs a job.
struct UnitChange<'a> {
    unit: &'a ContentUnit,
    content_id: ContentId,
    version: String,
    token: Option<String>,
    /// The ledger had the unit as missing or deleted.
    reappeared: bool,
}

/// A token, when present, must match too; timestamps alone are ambiguous.
fn version_matches(record: &SeenRecord, version: &str, token: Option<&str>) -> bool {
    record.last_seen_version == version
        && token_matches(record.last_seen_version_token.as_deref(), token)
}

/// An incoming token must equal a non-blank recorded one; no token matches anything.
fn token_matches(recorded: Option<&str>, incoming: Option<&str>) -> bool {
    match incoming {
        Some(token) => normalize_token(recorded).as_deref() == Some(token),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str, token: Option<&str>) -> SeenRecord {
        SeenRecord {
            content_id: ContentId::from_triple("lms", "wiki_page", "wiki:1:7"),
            source_system: "lms".into(),
            source_kind: "wiki_page".into(),
            source_locator: "wiki:1:7".into(),
            container_id: Some(1),
            source_int_id: Some(7),
            last_seen_version: version.into(),
            last_seen_version_token: token.map(str::to_string),
            last_seen_at: Utc::now(),
            missing_since: None,
            delete_job_id: None,
            deleted_at: None,
        }
    }

    #[test]
    fn test_version_matches_without_token() {
        let r = record("2024-01-01 10:00:00", Some("abc"));
        assert!(version_matches(&r, "2024-01-01 10:00:00", None));
        assert!(!version_matches(&r, "2024-01-01 11:00:00", None));
    }

    #[test]
    fn test_version_matches_with_token() {
        let r = record("2024-01-01 10:00:00", Some("abc"));
        assert!(version_matches(&r, "2024-01-01 10:00:00", Some("abc")));
        assert!(!version_matches(&r, "2024-01-01 10:00:00", Some("def")));

        // A recorded version without a token never matches a tokened one.
        let bare = record("2024-01-01 10:00:00", None);
        assert!(!version_matches(&bare, "2024-01-01 10:00:00", Some("abc")));
        let blank = record("2024-01-01 10:00:00", Some("  "));
        assert!(!version_matches(&blank, "2024-01-01 10:00:00", Some("abc")));
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches(Some("abc"), None));
        assert!(token_matches(None, None));
        assert!(token_matches(Some(" abc "), Some("abc")));
        assert!(!token_matches(None, Some("abc")));
        assert!(!token_matches(Some("abd"), Some("abc")));
    }

    #[test]
    fn test_normalize_version_and_token() {
        assert_eq!(
            normalize_version(Some(" 2024-01-01 10:00:00 ")),
            "2024-01-01 10:00:00"
        );
        let now = normalize_version(Some("   "));
        assert_eq!(now.len(), "2024-01-01 10:00:00".len());
        assert!(normalize_version(None).starts_with("20"));

        assert_eq!(normalize_token(Some("  ")), None);
        assert_eq!(normalize_token(Some(" x ")).as_deref(), Some("x"));
        assert_eq!(positive(Some(0)), None);
        assert_eq!(positive(Some(-3)), None);
        assert_eq!(positive(Some(9)), Some(9));
    }

    #[test]
    fn test_report_summary_line() {
        let report = RunReport {
            changed: 3,
            deleted: 1,
            providers: 2,
            errors: 0,
            toggles: 1,
            ..RunReport::default()
        };
        assert_eq!(
            report.to_string(),
            "enqueue done - changed:3 deleted:1 suppressed:0 providers:2 errors:0 toggles:1"
        );
    }
}
