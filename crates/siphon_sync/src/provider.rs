//! Capability interface for content sources.
//!
//! The engine holds a list of `Arc<dyn ContentProvider>`, one per kind. A
//! provider never touches the job table; it only answers questions about
//! the source.

use crate::cursor::ContentCursor;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// One content unit as reported by a provider's change page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub source_system: String,
    pub source_kind: String,
    pub source_locator: String,
    pub container_id: Option<i64>,
    pub source_int_id: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Version timestamp, `YYYY-MM-DD HH:MM:SS`.
    pub content_updated_at: Option<String>,
    /// Optional content hash disambiguating same-timestamp changes.
    pub version_token: Option<String>,
}

impl ContentUnit {
    pub fn source_ref(&self) -> SourceRef<'_> {
        SourceRef {
            locator: &self.source_locator,
            container_id: self.container_id,
            source_int_id: self.source_int_id,
        }
    }
}

/// A page of changed units plus the cursor to resume from.
#[derive(Debug, Clone, Default)]
pub struct ContentBatch {
    pub units: Vec<ContentUnit>,
    pub next_cursor: ContentCursor,
}

/// Body of a content unit. `title` and `content` are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPayload {
    pub title: String,
    pub content: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Address of a unit inside its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRef<'a> {
    pub locator: &'a str,
    pub container_id: Option<i64>,
    pub source_int_id: Option<i64>,
}

#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Stable name, part of the persisted cursor key.
    fn name(&self) -> &str;

    fn source_system(&self) -> &str;

    fn source_kind(&self) -> &str;

    /// Inactive providers are skipped by scans and by the claimer.
    fn is_active(&self) -> bool {
        true
    }

    /// Units with `(changed_at, id)` after `cursor`, ascending, at most `limit`.
    async fn fetch_changed(
        &self,
        cursor: &ContentCursor,
        limit: usize,
    ) -> Result<ContentBatch, ProviderError>;

    /// Source-internal ids of units that no longer exist.
    async fn fetch_missing_ids(&self, limit: usize) -> Result<Vec<i64>, ProviderError>;

    /// `None` when the unit has no content (yet).
    async fn fetch_content(&self, at: SourceRef<'_>)
        -> Result<Option<ContentPayload>, ProviderError>;

    async fn fetch_read_roles(&self, at: SourceRef<'_>) -> Result<Vec<i64>, ProviderError>;

    async fn direct_link(&self, at: SourceRef<'_>) -> Result<Option<String>, ProviderError>;
}

/// Placement of container objects in the source's object tree.
#[async_trait]
pub trait ObjectTreeResolver: Send + Sync {
    /// References under which the object is mounted, ascending.
    async fn mount_ref_ids(&self, object_id: i64) -> Result<Vec<i64>, ProviderError>;

    /// Every reference on any path from the root to a mount, ascending and unique.
    async fn ancestor_ref_ids(&self, object_id: i64) -> Result<Vec<i64>, ProviderError>;
}

/// Resolver for sources without an object tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTree;

#[async_trait]
impl ObjectTreeResolver for NoTree {
    async fn mount_ref_ids(&self, _object_id: i64) -> Result<Vec<i64>, ProviderError> {
        Ok(Vec::new())
    }

    async fn ancestor_ref_ids(&self, _object_id: i64) -> Result<Vec<i64>, ProviderError> {
        Ok(Vec::new())
    }
}

/// Read-through cache of read-operation ids per object type.
///
/// Owned by a provider instance and filled lazily; a lookup that found
/// nothing is cached as `None` too.
#[derive(Debug, Default)]
pub struct ReadOperationCache {
    ids: Mutex<HashMap<String, Option<i64>>>,
}

impl ReadOperationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load<F>(&self, object_type: &str, load: F) -> Option<i64>
    where
        F: FnOnce(&str) -> Option<i64>,
    {
        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cached) = ids.get(object_type) {
            return *cached;
        }
        let loaded = load(object_type).filter(|id| *id > 0);
        ids.insert(object_type.to_string(), loaded);
        loaded
    }

    pub fn len(&self) -> usize {
        self.ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_read_operation_cache_loads_once() {
        let cache = ReadOperationCache::new();
        let calls = Cell::new(0);

        let load = |ty: &str| {
            calls.set(calls.get() + 1);
            if ty == "wiki" {
                Some(3)
            } else {
                None
            }
        };

        assert_eq!(cache.get_or_load("wiki", load), Some(3));
        assert_eq!(cache.get_or_load("wiki", load), Some(3));
        assert_eq!(cache.get_or_load("blog", load), None);
        assert_eq!(cache.get_or_load("blog", load), None);
        assert_eq!(calls.get(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_payload_keeps_extra_fields() {
        let json = r#"{"title":"T","content":"<p>x</p>","lang":"de"}"#;
        let payload: ContentPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.title, "T");
        assert_eq!(payload.extra.get("lang").and_then(|v| v.as_str()), Some("de"));
    }
}
