//! Kind enable/disable transitions and the bulk teardown of a kind.

use crate::engine::SyncEngine;
use crate::error::Result;
use crate::keys;
use siphon_db::SiphonDb;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// What [`SyncEngine::apply_kind_transition`] did for one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindTransition {
    /// First observation: the flag was recorded, nothing else happened.
    Initialized { enabled: bool },
    Unchanged,
    /// Enabled to disabled: pending upserts retired, ledger torn down.
    Disabled { superseded: u64, delete_jobs: u64 },
    /// Disabled to enabled: leftover jobs removed, cursors reset.
    Enabled { removed_jobs: u64 },
}

impl KindTransition {
    pub fn is_transition(&self) -> bool {
        matches!(self, Self::Disabled { .. } | Self::Enabled { .. })
    }
}

/// Operator toggle: store the override and clear the run gate so the next
/// scheduled run acts on it immediately.
pub async fn set_kind_enabled(db: &SiphonDb, kind: &str, enabled: bool) -> Result<()> {
    db.set_kind_override(kind, enabled).await?;
    db.delete_state(keys::LAST_RUN_AT).await?;
    info!(kind, enabled, "Kind toggled");
    Ok(())
}

/// Drop the operator override so the configured default applies again.
/// Returns false if there was none.
pub async fn clear_kind_override(db: &SiphonDb, kind: &str) -> Result<bool> {
    let cleared = db.clear_kind_override(kind).await?;
    if cleared {
        db.delete_state(keys::LAST_RUN_AT).await?;
        info!(kind, "Kind override cleared");
    }
    Ok(cleared)
}

impl SyncEngine {
    /// Every kind the engine knows of: provider kinds, configured kinds and
    /// operator overrides.
    pub async fn known_kinds(&self) -> Result<BTreeSet<String>> {
        let mut kinds: BTreeSet<String> = self
            .providers
            .iter()
            .map(|p| p.source_kind().to_string())
            .collect();
        kinds.extend(self.config.kinds.keys().cloned());
        for setting in self.db.list_kind_overrides().await? {
            kinds.insert(setting.kind);
        }
        Ok(kinds)
    }

    /// Apply pending transitions for all known kinds. Returns how many kinds
    /// actually flipped.
    pub async fn sync_kind_transitions(&self) -> Result<u64> {
        let mut flipped = 0;
        for kind in self.known_kinds().await? {
            if self.apply_kind_transition(&kind).await?.is_transition() {
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    /// Compare a kind's current flag with the last one acted on.
    ///
    /// The stored flag is written only after the transition's work is done,
    /// so an interrupted teardown is resumed on the next run.
    pub async fn apply_kind_transition(&self, kind: &str) -> Result<KindTransition> {
        let key = keys::kind_enabled(kind);
        let enabled = self.is_kind_enabled(kind).await?;
        let previous = self.db.get_state(&key).await?;
        let flag = if enabled { "1" } else { "0" };

        let Some(previous) = previous else {
            self.db.set_state(&key, flag).await?;
            debug!(kind, enabled, "Kind flag initialized");
            return Ok(KindTransition::Initialized { enabled });
        };

        let was_enabled = previous.trim() == "1";
        let transition = match (was_enabled, enabled) {
            (true, false) => {
                let superseded = self.db.supersede_pending_upserts_for_kind(kind).await?;
                let delete_jobs = self.bulk_delete_kind(kind).await?;
                self.reset_provider_cursors(kind).await?;
                let dropped = self.db.delete_seen_for_kind(kind).await?;
                self.db.delete_state(&keys::bulk_delete_after(kind)).await?;
                info!(kind, superseded, delete_jobs, dropped, "Kind disabled");
                KindTransition::Disabled {
                    superseded,
                    delete_jobs,
                }
            }
            (false, true) => {
                let removed_jobs = self.db.delete_jobs_for_kind(kind).await?;
                self.reset_provider_cursors(kind).await?;
                info!(kind, removed_jobs, "Kind enabled, full rebuild on next scan");
                KindTransition::Enabled { removed_jobs }
            }
            _ => KindTransition::Unchanged,
        };

        if previous.trim() != flag {
            self.db.set_state(&key, flag).await?;
        }
        Ok(transition)
    }

    /// Issue a delete job for every not-yet-deleted ledger record of a kind.
    ///
    /// Pages by `content_id` after a persisted cursor, so a crash mid-way
    /// resumes where it stopped instead of rescanning. Returns the number of
    /// delete jobs created.
    pub async fn bulk_delete_kind(&self, kind: &str) -> Result<u64> {
        let key = keys::bulk_delete_after(kind);
        let batch = self.config.bulk_delete_batch.max(1);
        let mut after = keys::parse_bulk_cursor(self.db.get_state(&key).await?.as_deref());
        let mut created = 0u64;

        loop {
            let page = self
                .db
                .page_live_for_kind(kind, after.as_ref(), batch as i64)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            let last_id = last.content_id;

            for record in &page {
                match self.enqueue_delete(record).await {
                    Ok(true) => created += 1,
                    Ok(false) => {}
                    Err(e) => {
                        // Leave the cursor before this page so the next run retries it.
                        warn!(kind, content_id = %record.content_id, error = %e, "Bulk delete failed");
                        return Err(e);
                    }
                }
            }

            self.db.set_state(&key, &last_id.to_hex()).await?;
            after = Some(last_id);
            debug!(kind, page = page.len(), created, "Bulk delete page done");

            if page.len() < batch {
                break;
            }
        }

        Ok(created)
    }

    async fn reset_provider_cursors(&self, kind: &str) -> Result<()> {
        for provider in self.providers.iter().filter(|p| p.source_kind() == kind) {
            let key = keys::provider_cursor(provider.name(), provider.source_system(), kind);
            self.db.delete_state(&key).await?;
        }

        // Cursors of providers that are no longer registered.
        let suffix = format!(".{kind}.cursor");
        for (key, _) in self.db.list_state(keys::PROVIDER_CURSOR_PREFIX).await? {
            if key.ends_with(&suffix) {
                self.db.delete_state(&key).await?;
            }
        }
        Ok(())
    }
}
