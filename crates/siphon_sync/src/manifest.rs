//! Provider backed by a JSON snapshot of the source.
//!
//! Lets the CLI run end to end against an export instead of a live LMS:
//!
//! ```json
//! {
//!   "source_system": "lms",
//!   "read_operations": { "wiki": 3 },
//!   "grants": [ { "object_id": 1, "role_id": 4, "operations": [3] } ],
//!   "tree": { "objects": { "1": [110] }, "paths": { "110": "1.20.110" } },
//!   "kinds": {
//!     "wiki_page": {
//!       "object_type": "wiki",
//!       "link_template": "goto.php/wiki/wpage_{int_id}_{ref_id}",
//!       "units": [
//!         { "locator": "wiki:1:7", "container_id": 1, "int_id": 7,
//!           "title": "Intro", "changed_at": "2024-01-01 10:00:00",
//!           "version_token": "9f2c", "content": "<h1>Intro</h1>" }
//!       ]
//!     }
//!   }
//! }
//! ```

use crate::cursor::ContentCursor;
use crate::error::{ProviderError, Result, SyncError};
use crate::provider::{
    ContentBatch, ContentPayload, ContentProvider, ContentUnit, ObjectTreeResolver,
    ReadOperationCache, SourceRef,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use siphon_db::SiphonDb;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_source_system")]
    pub source_system: String,

    /// Read-operation id per object type
    #[serde(default)]
    pub read_operations: BTreeMap<String, i64>,

    #[serde(default)]
    pub grants: Vec<RoleGrant>,

    #[serde(default)]
    pub tree: ManifestTree,

    #[serde(default)]
    pub kinds: BTreeMap<String, ManifestKind>,
}

fn default_source_system() -> String {
    "lms".to_string()
}

/// Operations a role holds on an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleGrant {
    pub object_id: i64,
    pub role_id: i64,
    #[serde(default)]
    pub operations: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestKind {
    /// Provider name; defaults to the kind
    #[serde(default)]
    pub provider: Option<String>,

    /// Object type used for read-operation lookup
    #[serde(default)]
    pub object_type: Option<String>,

    /// Placeholders: `{int_id}`, `{container_id}`, `{ref_id}`
    #[serde(default)]
    pub link_template: Option<String>,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub units: Vec<ManifestUnit>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestUnit {
    pub locator: String,
    #[serde(default)]
    pub container_id: Option<i64>,
    #[serde(default)]
    pub int_id: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub changed_at: Option<String>,
    #[serde(default)]
    pub version_token: Option<String>,
    /// Body; units without one have nothing to index yet
    #[serde(default)]
    pub content: Option<String>,
}

/// Object placement: object id to mount references, reference to tree path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestTree {
    #[serde(default)]
    pub objects: BTreeMap<i64, Vec<i64>>,
    /// Dotted root-to-node paths, e.g. `"1.20.110"`
    #[serde(default)]
    pub paths: BTreeMap<i64, String>,
}

impl ManifestTree {
    fn mounts(&self, object_id: i64) -> Vec<i64> {
        let mut refs: Vec<i64> = self
            .objects
            .get(&object_id)
            .map(|refs| refs.iter().copied().filter(|r| *r > 0).collect())
            .unwrap_or_default();
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}

fn parse_path(path: &str) -> impl Iterator<Item = i64> + '_ {
    path.trim()
        .split('.')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
}

#[async_trait]
impl ObjectTreeResolver for ManifestTree {
    async fn mount_ref_ids(&self, object_id: i64) -> std::result::Result<Vec<i64>, ProviderError> {
        Ok(self.mounts(object_id))
    }

    async fn ancestor_ref_ids(&self, object_id: i64) -> std::result::Result<Vec<i64>, ProviderError> {
        let mounts = self.mounts(object_id);
        let paths: Vec<&String> = mounts.iter().filter_map(|r| self.paths.get(r)).collect();
        if paths.is_empty() {
            // No path known: the mounts are the best answer.
            return Ok(mounts);
        }

        let ancestors: BTreeSet<i64> = paths.iter().flat_map(|p| parse_path(p)).collect();
        Ok(ancestors.into_iter().collect())
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Every unit needs a locator, a change time and a positive int id, and
    /// both ids are unique within a kind. `(changed_at, int_id)` is the change
    /// cursor, so a unit without them could be skipped at a page boundary.
    pub fn validate(&self) -> Result<()> {
        for (kind, entry) in &self.kinds {
            let mut locators = HashSet::new();
            let mut int_ids = HashSet::new();
            for unit in &entry.units {
                let locator = unit.locator.trim();
                if locator.is_empty() {
                    return Err(invalid_unit(kind, "a unit without locator"));
                }
                if unit.changed_at.as_deref().map_or(true, |at| at.trim().is_empty()) {
                    return Err(invalid_unit(kind, &format!("unit '{locator}' without changed_at")));
                }
                let Some(int_id) = unit.int_id.filter(|id| *id > 0) else {
                    return Err(invalid_unit(kind, &format!("unit '{locator}' without a positive int_id")));
                };
                if !locators.insert(locator) {
                    return Err(invalid_unit(kind, &format!("locator '{locator}' twice")));
                }
                if !int_ids.insert(int_id) {
                    return Err(invalid_unit(kind, &format!("int_id {int_id} twice")));
                }
            }
        }
        Ok(())
    }

    /// One provider per kind, in kind order.
    pub fn providers(self: &Arc<Self>, db: &SiphonDb) -> Vec<Arc<dyn ContentProvider>> {
        self.kinds
            .keys()
            .map(|kind| {
                Arc::new(ManifestProvider::new(Arc::clone(self), kind, db.clone()))
                    as Arc<dyn ContentProvider>
            })
            .collect()
    }
}

fn invalid_unit(kind: &str, problem: &str) -> SyncError {
    SyncError::Config(format!("manifest kind '{kind}' has {problem}"))
}

/// [`ContentProvider`] for one kind of a [`Manifest`].
pub struct ManifestProvider {
    manifest: Arc<Manifest>,
    kind: String,
    name: String,
    db: SiphonDb,
    read_ops: ReadOperationCache,
}

impl ManifestProvider {
    pub fn new(manifest: Arc<Manifest>, kind: &str, db: SiphonDb) -> Self {
        let name = manifest
            .kinds
            .get(kind)
            .and_then(|entry| entry.provider.clone())
            .unwrap_or_else(|| kind.to_string());
        Self {
            manifest,
            kind: kind.to_string(),
            name,
            db,
            read_ops: ReadOperationCache::new(),
        }
    }

    fn entry(&self) -> Option<&ManifestKind> {
        self.manifest.kinds.get(&self.kind)
    }

    fn units(&self) -> &[ManifestUnit] {
        self.entry().map(|entry| entry.units.as_slice()).unwrap_or(&[])
    }

    fn find(&self, locator: &str) -> Option<&ManifestUnit> {
        self.units().iter().find(|u| u.locator == locator)
    }

    fn to_unit(&self, unit: &ManifestUnit) -> ContentUnit {
        ContentUnit {
            source_system: self.manifest.source_system.clone(),
            source_kind: self.kind.clone(),
            source_locator: unit.locator.clone(),
            container_id: unit.container_id,
            source_int_id: unit.int_id,
            title: unit.title.clone(),
            description: unit.description.clone(),
            content_updated_at: unit.changed_at.clone(),
            version_token: unit.version_token.clone(),
        }
    }
}

#[async_trait]
impl ContentProvider for ManifestProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_system(&self) -> &str {
        &self.manifest.source_system
    }

    fn source_kind(&self) -> &str {
        &self.kind
    }

    fn is_active(&self) -> bool {
        self.entry().map(|entry| entry.active).unwrap_or(false)
    }

    async fn fetch_changed(
        &self,
        cursor: &ContentCursor,
        limit: usize,
    ) -> std::result::Result<ContentBatch, ProviderError> {
        let mut changed: Vec<(&str, i64, &ManifestUnit)> = self
            .units()
            .iter()
            .filter_map(|u| {
                let at = u.changed_at.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
                let id = u.int_id.unwrap_or(0);
                cursor.admits(at, id).then_some((at, id, u))
            })
            .collect();
        changed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        changed.truncate(limit.max(1));

        let mut next = cursor.clone();
        let units = changed
            .into_iter()
            .map(|(at, id, u)| {
                next.advance(at, id);
                self.to_unit(u)
            })
            .collect();

        Ok(ContentBatch {
            units,
            next_cursor: next,
        })
    }

    async fn fetch_missing_ids(&self, limit: usize) -> std::result::Result<Vec<i64>, ProviderError> {
        let present: HashSet<i64> = self.units().iter().filter_map(|u| u.int_id).collect();
        let live = self
            .db
            .live_int_ids(&self.manifest.source_system, &self.kind)
            .await
            .map_err(|e| ProviderError::Query(e.to_string()))?;

        Ok(live
            .into_iter()
            .filter(|id| !present.contains(id))
            .take(limit)
            .collect())
    }

    async fn fetch_content(
        &self,
        at: SourceRef<'_>,
    ) -> std::result::Result<Option<ContentPayload>, ProviderError> {
        let Some(unit) = self.find(at.locator) else {
            return Ok(None);
        };
        let Some(content) = unit.content.as_ref().filter(|c| !c.trim().is_empty()) else {
            return Ok(None);
        };

        let title = unit
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} #{}", self.kind, unit.int_id.unwrap_or(0)));

        let mut extra = serde_json::Map::new();
        if let Some(description) = &unit.description {
            extra.insert("description".into(), description.clone().into());
        }

        Ok(Some(ContentPayload {
            title,
            content: content.clone(),
            extra,
        }))
    }

    async fn fetch_read_roles(&self, at: SourceRef<'_>) -> std::result::Result<Vec<i64>, ProviderError> {
        let Some(object_id) = at.container_id.filter(|id| *id > 0) else {
            return Ok(Vec::new());
        };
        let object_type = self
            .entry()
            .and_then(|entry| entry.object_type.as_deref())
            .unwrap_or(self.kind.as_str());

        let Some(read_op) = self
            .read_ops
            .get_or_load(object_type, |ty| self.manifest.read_operations.get(ty).copied())
        else {
            return Ok(Vec::new());
        };

        let roles: BTreeSet<i64> = self
            .manifest
            .grants
            .iter()
            .filter(|g| g.object_id == object_id && g.role_id > 0 && g.operations.contains(&read_op))
            .map(|g| g.role_id)
            .collect();
        Ok(roles.into_iter().collect())
    }

    async fn direct_link(&self, at: SourceRef<'_>) -> std::result::Result<Option<String>, ProviderError> {
        let Some(template) = self.entry().and_then(|entry| entry.link_template.as_deref()) else {
            return Ok(None);
        };
        let (Some(container_id), Some(int_id)) = (at.container_id, at.source_int_id) else {
            return Ok(None);
        };

        let mut link = template
            .replace("{int_id}", &int_id.to_string())
            .replace("{container_id}", &container_id.to_string());
        if link.contains("{ref_id}") {
            let Some(ref_id) = self.manifest.tree.mounts(container_id).first().copied() else {
                return Ok(None);
            };
            link = link.replace("{ref_id}", &ref_id.to_string());
        }
        Ok(Some(link))
    }
}
