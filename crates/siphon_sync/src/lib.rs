//! siphon sync - turns content changes into durable, idempotent jobs.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Content    │     │ SyncEngine  │     │  Job table  │     │  JobClaimer  │
//! │  providers  │────▶│ (diff vs    │────▶│  (pending)  │────▶│ (lease, build│
//! │  (per kind) │     │ seen ledger)│     │             │     │  work items) │
//! └─────────────┘     └─────────────┘     └─────────────┘     └──────────────┘
//!                                                ▲                   │
//!                                                └──── ack / fail ───┘
//! ```
//!
//! # Core Concepts
//!
//! - **Provider**: one per content kind; pages changes by cursor, reports missing ids
//! - **Seen ledger**: last observed version of every content unit
//! - **Job**: versioned upsert/delete work, leased to one worker at a time
//! - **Toggle**: enabling/disabling a kind rebuilds or tears down its indexed data

pub mod claimer;
pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod keys;
pub mod manifest;
pub mod provider;
pub mod transitions;
pub mod work_item;

pub use claimer::{ClaimReport, ItemOutcome, JobClaimer, SinkError, WorkSink};
pub use config::{ClaimConfig, SiphonConfig, SyncConfig};
pub use cursor::ContentCursor;
pub use engine::{DeleteStats, RunReport, ScanStats, SyncEngine, UnitOutcome};
pub use error::{ProviderError, Result, SyncError};
pub use manifest::{Manifest, ManifestKind, ManifestProvider, ManifestTree, ManifestUnit, RoleGrant};
pub use provider::{
    ContentBatch, ContentPayload, ContentProvider, ContentUnit, NoTree, ObjectTreeResolver,
    ReadOperationCache, SourceRef,
};
pub use transitions::{clear_kind_override, set_kind_enabled, KindTransition};
pub use work_item::{WorkAction, WorkItem};
