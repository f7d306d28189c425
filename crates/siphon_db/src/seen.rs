//! Seen ledger operations.

use crate::error::{DbError, Result};
use crate::types::{SeenEntry, SeenRecord};
use crate::{from_millis, from_millis_opt, now_millis, SiphonDb};
use siphon_ids::{ContentId, JobId};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashMap;

/// Upper bound on identifiers addressed by one lookup query.
pub const MAX_LOOKUP_CHUNK: usize = 500;

const SEEN_COLUMNS: &str = "content_id, source_system, source_kind, source_locator, container_id, \
     source_int_id, last_seen_version, last_seen_version_token, last_seen_at, missing_since, \
     delete_job_id, deleted_at";

fn chunk_size(requested: usize) -> usize {
    requested.clamp(1, MAX_LOOKUP_CHUNK)
}

impl SiphonDb {
    /// Insert or refresh the ledger row for a content unit.
    ///
    /// An update always clears the missing/deleted markers: the unit was just
    /// seen in the source.
    pub async fn upsert_seen(&self, entry: &SeenEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO siphon_seen (
                content_id, source_system, source_kind, source_locator, container_id,
                source_int_id, last_seen_version, last_seen_version_token, last_seen_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_id) DO UPDATE SET
                source_system = excluded.source_system,
                source_kind = excluded.source_kind,
                source_locator = excluded.source_locator,
                container_id = excluded.container_id,
                source_int_id = excluded.source_int_id,
                last_seen_version = excluded.last_seen_version,
                last_seen_version_token = excluded.last_seen_version_token,
                last_seen_at = excluded.last_seen_at,
                missing_since = NULL,
                delete_job_id = NULL,
                deleted_at = NULL
            "#,
        )
        .bind(entry.content_id.as_bytes().to_vec())
        .bind(&entry.source_system)
        .bind(&entry.source_kind)
        .bind(&entry.source_locator)
        .bind(entry.container_id)
        .bind(entry.source_int_id)
        .bind(&entry.version)
        .bind(entry.version_token.as_deref())
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_seen(&self, content_id: &ContentId) -> Result<Option<SeenRecord>> {
        let sql = format!("SELECT {SEEN_COLUMNS} FROM siphon_seen WHERE content_id = ?");
        let row = sqlx::query(&sql)
            .bind(content_id.as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_seen).transpose()
    }

    /// Batch lookup keyed by content id, at most `chunk` ids per query.
    pub async fn load_seen_by_ids(
        &self,
        ids: &[ContentId],
        chunk: usize,
    ) -> Result<HashMap<ContentId, SeenRecord>> {
        let mut found = HashMap::with_capacity(ids.len());

        for part in ids.chunks(chunk_size(chunk)) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {SEEN_COLUMNS} FROM siphon_seen WHERE content_id IN ("
            ));
            let mut list = qb.separated(", ");
            for id in part {
                list.push_bind(id.as_bytes().to_vec());
            }
            list.push_unseparated(")");

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in &rows {
                let record = row_to_seen(row)?;
                found.insert(record.content_id, record);
            }
        }

        Ok(found)
    }

    /// Set `missing_since` unless already set. Returns true if this call set it.
    pub async fn mark_missing(&self, content_id: &ContentId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE siphon_seen SET missing_since = ? WHERE content_id = ? AND missing_since IS NULL",
        )
        .bind(now_millis())
        .bind(content_id.as_bytes().to_vec())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record that the delete for this unit completed.
    ///
    /// Only a still-missing record is marked; content that re-appeared after
    /// the delete job was issued stays live.
    pub async fn mark_deleted(&self, content_id: &ContentId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE siphon_seen SET deleted_at = ?
            WHERE content_id = ? AND missing_since IS NOT NULL AND deleted_at IS NULL
            "#,
        )
        .bind(now_millis())
        .bind(content_id.as_bytes().to_vec())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn set_delete_job(&self, content_id: &ContentId, job_id: JobId) -> Result<()> {
        sqlx::query("UPDATE siphon_seen SET delete_job_id = ? WHERE content_id = ?")
            .bind(job_id.get())
            .bind(content_id.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Live records of one system/kind whose provider int id is in `ids`.
    pub async fn find_live_by_int_ids(
        &self,
        source_system: &str,
        source_kind: &str,
        ids: &[i64],
        chunk: usize,
    ) -> Result<Vec<SeenRecord>> {
        let mut found = Vec::new();

        for part in ids.chunks(chunk_size(chunk)) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("SELECT {SEEN_COLUMNS} FROM siphon_seen WHERE source_system = "));
            qb.push_bind(source_system.to_string());
            qb.push(" AND source_kind = ");
            qb.push_bind(source_kind.to_string());
            qb.push(" AND missing_since IS NULL AND deleted_at IS NULL AND source_int_id IN (");
            let mut list = qb.separated(", ");
            for id in part {
                list.push_bind(*id);
            }
            list.push_unseparated(") ORDER BY content_id");

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in &rows {
                found.push(row_to_seen(row)?);
            }
        }

        Ok(found)
    }

    /// Keyset page of not-yet-deleted records of a kind, ordered by content id.
    ///
    /// Resumes strictly after `after`; stable under concurrent inserts and
    /// deletes in a way an offset is not.
    pub async fn page_live_for_kind(
        &self,
        source_kind: &str,
        after: Option<&ContentId>,
        limit: i64,
    ) -> Result<Vec<SeenRecord>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {SEEN_COLUMNS} FROM siphon_seen WHERE source_kind = "));
        qb.push_bind(source_kind.to_string());
        qb.push(" AND deleted_at IS NULL");
        if let Some(after) = after {
            qb.push(" AND content_id > ");
            qb.push_bind(after.as_bytes().to_vec());
        }
        qb.push(" ORDER BY content_id ASC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_seen).collect()
    }

    /// Provider int ids of live records, ascending.
    pub async fn live_int_ids(&self, source_system: &str, source_kind: &str) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            r#"
            SELECT source_int_id FROM siphon_seen
            WHERE source_system = ? AND source_kind = ?
              AND source_int_id IS NOT NULL
              AND missing_since IS NULL AND deleted_at IS NULL
            ORDER BY source_int_id
            "#,
        )
        .bind(source_system)
        .bind(source_kind)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<i64, _>("source_int_id").map_err(DbError::from))
            .collect()
    }

    /// Hard-delete every ledger row of a kind.
    pub async fn delete_seen_for_kind(&self, source_kind: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM siphon_seen WHERE source_kind = ?")
            .bind(source_kind)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_seen(&self, source_kind: Option<&str>) -> Result<u64> {
        let row = match source_kind {
            Some(kind) => {
                sqlx::query("SELECT COUNT(*) AS n FROM siphon_seen WHERE source_kind = ?")
                    .bind(kind)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT COUNT(*) AS n FROM siphon_seen")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}

fn row_to_seen(row: &SqliteRow) -> Result<SeenRecord> {
    let raw_id: Vec<u8> = row.try_get("content_id")?;
    Ok(SeenRecord {
        content_id: ContentId::from_slice(&raw_id)?,
        source_system: row.try_get("source_system")?,
        source_kind: row.try_get("source_kind")?,
        source_locator: row.try_get("source_locator")?,
        container_id: row.try_get("container_id")?,
        source_int_id: row.try_get("source_int_id")?,
        last_seen_version: row.try_get("last_seen_version")?,
        last_seen_version_token: row.try_get("last_seen_version_token")?,
        last_seen_at: from_millis(row.try_get("last_seen_at")?)?,
        missing_since: from_millis_opt(row.try_get("missing_since")?)?,
        delete_job_id: row
            .try_get::<Option<i64>, _>("delete_job_id")?
            .map(JobId::new),
        deleted_at: from_millis_opt(row.try_get("deleted_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(locator: &str, int_id: i64, version: &str) -> SeenEntry {
        SeenEntry {
            content_id: ContentId::from_triple("lms", "wiki_page", locator),
            source_system: "lms".into(),
            source_kind: "wiki_page".into(),
            source_locator: locator.into(),
            container_id: Some(1),
            source_int_id: Some(int_id),
            version: version.into(),
            version_token: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_seen_clears_missing_markers() {
        let db = SiphonDb::open_in_memory().await.unwrap();
        let e = entry("wiki:1:7", 7, "2024-01-01 10:00:00");
        db.upsert_seen(&e).await.unwrap();

        assert!(db.mark_missing(&e.content_id).await.unwrap());
        assert!(db.mark_deleted(&e.content_id).await.unwrap());
        let gone = db.get_seen(&e.content_id).await.unwrap().unwrap();
        assert!(!gone.is_live());

        let mut back = e.clone();
        back.version = "2024-01-01 11:00:00".into();
        db.upsert_seen(&back).await.unwrap();

        let seen = db.get_seen(&e.content_id).await.unwrap().unwrap();
        assert!(seen.is_live());
        assert!(seen.delete_job_id.is_none());
        assert_eq!(seen.last_seen_version, "2024-01-01 11:00:00");
    }

    #[tokio::test]
    async fn test_upsert_seen_is_repeatable() {
        let db = SiphonDb::open_in_memory().await.unwrap();
        let e = entry("wiki:1:7", 7, "2024-01-01 10:00:00");
        db.upsert_seen(&e).await.unwrap();
        db.upsert_seen(&e).await.unwrap();

        assert_eq!(db.count_seen(None).await.unwrap(), 1);
        let seen = db.get_seen(&e.content_id).await.unwrap().unwrap();
        assert_eq!(seen.last_seen_version, e.version);
        assert_eq!(seen.source_int_id, Some(7));
    }

    #[tokio::test]
    async fn test_mark_missing_first_observer_wins() {
        let db = SiphonDb::open_in_memory().await.unwrap();
        let e = entry("wiki:1:7", 7, "v");
        db.upsert_seen(&e).await.unwrap();

        assert!(db.mark_missing(&e.content_id).await.unwrap());
        let first = db.get_seen(&e.content_id).await.unwrap().unwrap().missing_since;
        assert!(!db.mark_missing(&e.content_id).await.unwrap());
        let second = db.get_seen(&e.content_id).await.unwrap().unwrap().missing_since;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_mark_deleted_requires_missing() {
        let db = SiphonDb::open_in_memory().await.unwrap();
        let e = entry("wiki:1:7", 7, "v");
        db.upsert_seen(&e).await.unwrap();

        assert!(!db.mark_deleted(&e.content_id).await.unwrap());
        assert!(db.get_seen(&e.content_id).await.unwrap().unwrap().deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_load_seen_by_ids_spans_chunks() {
        let db = SiphonDb::open_in_memory().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..25 {
            let e = entry(&format!("wiki:1:{i}"), i, "v");
            ids.push(e.content_id);
            db.upsert_seen(&e).await.unwrap();
        }
        ids.push(ContentId::from_triple("lms", "wiki_page", "never-seen"));

        let found = db.load_seen_by_ids(&ids, 4).await.unwrap();
        assert_eq!(found.len(), 25);
        assert!(found.contains_key(&ids[0]));
        assert!(!found.contains_key(&ids[25]));
    }

    #[tokio::test]
    async fn test_find_live_by_int_ids_skips_missing() {
        let db = SiphonDb::open_in_memory().await.unwrap();
        let a = entry("wiki:1:1", 1, "v");
        let b = entry("wiki:1:2", 2, "v");
        db.upsert_seen(&a).await.unwrap();
        db.upsert_seen(&b).await.unwrap();
        db.mark_missing(&b.content_id).await.unwrap();

        let found = db
            .find_live_by_int_ids("lms", "wiki_page", &[1, 2, 3], 100)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_int_id, Some(1));

        let other_kind = db
            .find_live_by_int_ids("lms", "glossary_term", &[1], 100)
            .await
            .unwrap();
        assert!(other_kind.is_empty());
    }

    #[tokio::test]
    async fn test_page_live_for_kind_keyset() {
        let db = SiphonDb::open_in_memory().await.unwrap();
        for i in 0..7 {
            db.upsert_seen(&entry(&format!("wiki:1:{i}"), i, "v")).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut after: Option<ContentId> = None;
        loop {
            let page = db.page_live_for_kind("wiki_page", after.as_ref(), 3).await.unwrap();
            let len = page.len();
            if let Some(last) = page.last() {
                after = Some(last.content_id);
            }
            seen.extend(page.into_iter().map(|r| r.content_id));
            if len < 3 {
                break;
            }
        }

        assert_eq!(seen.len(), 7);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn test_live_int_ids_and_delete_for_kind() {
        let db = SiphonDb::open_in_memory().await.unwrap();
        for i in [3, 1, 2] {
            db.upsert_seen(&entry(&format!("wiki:1:{i}"), i, "v")).await.unwrap();
        }
        assert_eq!(db.live_int_ids("lms", "wiki_page").await.unwrap(), vec![1, 2, 3]);

        assert_eq!(db.delete_seen_for_kind("wiki_page").await.unwrap(), 3);
        assert_eq!(db.count_seen(Some("wiki_page")).await.unwrap(), 0);
    }
}
