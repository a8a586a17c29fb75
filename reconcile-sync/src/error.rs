//! Error types for the sync layer.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Conflicts are not errors: they surface as a resolution outcome. Only
/// rejected input and infrastructure failures end up here.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The update's validator rejected its data.
    #[error("validation failed for key {key}")]
    Validation { key: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cache backend error.
    #[error("cache error: {0}")]
    Cache(String),
}
