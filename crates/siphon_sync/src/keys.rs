//! Key names in the process state table.

use siphon_ids::ContentId;

/// RFC 3339 time of the last completed engine run.
pub const LAST_RUN_AT: &str = "enqueue.last_run_at";

/// Last enabled flag the engine acted on (`"1"` / `"0"`).
pub fn kind_enabled(kind: &str) -> String {
    format!("enqueue.kind.{kind}.enabled")
}

/// Last content id processed by an interrupted bulk delete.
pub fn bulk_delete_after(kind: &str) -> String {
    format!("enqueue.kind.{kind}.bulk_delete_after")
}

/// Common prefix of all provider cursor keys.
pub const PROVIDER_CURSOR_PREFIX: &str = "enqueue.provider.";

/// Change cursor of one provider.
pub fn provider_cursor(provider: &str, system: &str, kind: &str) -> String {
    format!("enqueue.provider.{provider}.{system}.{kind}.cursor")
}

/// Parse a persisted bulk-delete cursor; anything malformed restarts the scan.
pub fn parse_bulk_cursor(raw: Option<&str>) -> Option<ContentId> {
    raw.and_then(|value| ContentId::parse(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(kind_enabled("wiki_page"), "enqueue.kind.wiki_page.enabled");
        assert_eq!(
            provider_cursor("wiki_pages", "lms", "wiki_page"),
            "enqueue.provider.wiki_pages.lms.wiki_page.cursor"
        );
    }

    #[test]
    fn test_bulk_cursor_rejects_garbage() {
        assert_eq!(parse_bulk_cursor(None), None);
        assert_eq!(parse_bulk_cursor(Some("nope")), None);
        let id = ContentId::from_triple("a", "b", "c");
        assert_eq!(parse_bulk_cursor(Some(&id.to_hex())), Some(id));
    }
}
