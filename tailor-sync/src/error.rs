//! Sync error types.

use tailor_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while syncing or writing through the storage policy.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("API request failed: {0}")]
    Api(String),

    #[error("remote service unreachable")]
    Offline,

    #[error("local storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Local capacity exhaustion, the one failure surfaced to callers.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, SyncError::Storage(e) if e.is_capacity_exceeded())
    }
}
