//! Events published by the sync manager.
//!
//! Events go out on a global broadcast topic (see
//! [`SyncManager::subscribe_events`](crate::SyncManager::subscribe_events)).
//! Per-key commit delivery goes through [`Subscription`](crate::Subscription)
//! instead, which never drops.

use crate::resolver::PendingConflict;
use crate::store::SynchronizedData;

/// Something observable happened in the sync manager.
#[derive(Debug, Clone)]
pub enum SyncEvent<T> {
    /// A conflict strategy was registered for a key.
    KeyRegistered {
        key: String,
        strategy: &'static str,
    },
    /// A new canonical value was committed.
    DataUpdated {
        key: String,
        data: SynchronizedData<T>,
    },
    /// All state for a key was cleared.
    DataCleared { key: String },
    /// A staleness sweep finished.
    CleanupCompleted {
        removed_keys: Vec<String>,
        expired_conflicts: usize,
    },
    /// An update was buffered for manual resolution.
    ConflictDetected {
        key: String,
        operation: PendingConflict<T>,
        existing: SynchronizedData<T>,
    },
    /// An operator resolved a buffered conflict.
    ConflictResolved {
        key: String,
        resolution: SynchronizedData<T>,
    },
}

impl<T> SyncEvent<T> {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeyRegistered { .. } => "key_registered",
            Self::DataUpdated { .. } => "data_updated",
            Self::DataCleared { .. } => "data_cleared",
            Self::CleanupCompleted { .. } => "cleanup_completed",
            Self::ConflictDetected { .. } => "conflict_detected",
            Self::ConflictResolved { .. } => "conflict_resolved",
        }
    }

    /// The key the event concerns, if it concerns a single key.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::KeyRegistered { key, .. }
            | Self::DataUpdated { key, .. }
            | Self::DataCleared { key }
            | Self::ConflictDetected { key, .. }
            | Self::ConflictResolved { key, .. } => Some(key),
            Self::CleanupCompleted { .. } => None,
        }
    }
}
