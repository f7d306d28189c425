//! String key/value process state and per-kind operator overrides.

use crate::error::Result;
use crate::types::KindSetting;
use crate::{from_millis, now_millis, SiphonDb};
use sqlx::Row;

impl SiphonDb {
    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM siphon_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO siphon_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns true if the key existed.
    pub async fn delete_state(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM siphon_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All entries whose key starts with `prefix`, sorted by key.
    pub async fn list_state(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT key, value FROM siphon_state WHERE substr(key, 1, length(?)) = ? ORDER BY key",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }

    // ========================================================================
    // Kind overrides
    // ========================================================================

    pub async fn set_kind_override(&self, kind: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO siphon_kind_settings (kind, enabled, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(kind) DO UPDATE SET enabled = excluded.enabled, updated_at = excluded.updated_at
            "#,
        )
        .bind(kind)
        .bind(enabled)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn kind_override(&self, kind: &str) -> Result<Option<bool>> {
        let row = sqlx::query("SELECT enabled FROM siphon_kind_settings WHERE kind = ?")
            .bind(kind)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<bool, _>("enabled")?)),
            None => Ok(None),
        }
    }

    pub async fn clear_kind_override(&self, kind: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM siphon_kind_settings WHERE kind = ?")
            .bind(kind)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_kind_overrides(&self) -> Result<Vec<KindSetting>> {
        let rows = sqlx::query("SELECT kind, enabled, updated_at FROM siphon_kind_settings ORDER BY kind")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<KindSetting> {
                Ok(KindSetting {
                    kind: row.try_get("kind")?,
                    enabled: row.try_get("enabled")?,
                    updated_at: from_millis(row.try_get("updated_at")?)?,
                })
            })
            .collect()
    }
}
