//! Error types for the sync layer.

use siphon_db::DbError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures reported by a content provider or tree resolver.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Source query failed: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
