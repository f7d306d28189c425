//! Resumption point for incremental change scans.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp used when no cursor has been stored yet.
pub const EPOCH: &str = "1970-01-01 00:00:00";

/// `(changed_at, changed_id)` of the last unit handed out.
///
/// Ordered first by timestamp, then by the tie-breaking id, which is the
/// same order providers must page in. Timestamps are `YYYY-MM-DD HH:MM:SS`
/// and compare correctly as strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentCursor {
    pub changed_at: String,
    pub changed_id: i64,
}

impl ContentCursor {
    pub fn new(changed_at: impl Into<String>, changed_id: i64) -> Self {
        Self {
            changed_at: changed_at.into(),
            changed_id,
        }
    }

    /// The cursor before anything was seen.
    pub fn start() -> Self {
        Self::new(EPOCH, 0)
    }

    /// Parse the persisted `"<timestamp>|<id>"` form.
    ///
    /// Empty input or `"0"` yields [`ContentCursor::start`]; a missing
    /// timestamp falls back to the epoch and an unparseable id to 0.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "0" {
            return Self::start();
        }

        let (ts, id) = match raw.split_once('|') {
            Some((ts, id)) => (ts.trim(), id.trim()),
            None => (raw, ""),
        };
        let ts = if ts.is_empty() { EPOCH } else { ts };
        Self::new(ts, id.parse().unwrap_or(0))
    }

    /// True if a unit at `(changed_at, id)` comes strictly after this cursor.
    pub fn admits(&self, changed_at: &str, id: i64) -> bool {
        changed_at > self.changed_at.as_str()
            || (changed_at == self.changed_at && id > self.changed_id)
    }

    /// Move forward to `(changed_at, id)` if that is later.
    pub fn advance(&mut self, changed_at: &str, id: i64) {
        if self.admits(changed_at, id) {
            self.changed_at = changed_at.to_string();
            self.changed_id = id;
        }
    }
}

impl Default for ContentCursor {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Display for ContentCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.changed_at, self.changed_id)
    }
}
