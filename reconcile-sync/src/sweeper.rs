//! Staleness sweeping.
//!
//! A key whose value has not been refreshed within the staleness threshold
//! reads as stale; once it has been idle for twice the threshold it is
//! purged. Manual conflicts nobody resolved expire after their own
//! retention window.

use crate::resolver::ConflictBuffer;
use crate::store::DataStore;
use reconcile_types::Timestamp;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Keys purged for being idle past twice the staleness threshold.
    pub removed_keys: Vec<String>,
    /// Buffered manual conflicts dropped for age.
    pub expired_conflicts: usize,
    /// Keys that are stale but were kept.
    pub stale_keys: usize,
}

/// Periodic cleanup policy.
#[derive(Debug, Clone, Copy)]
pub struct StalenessSweeper {
    /// How often the sweep runs.
    pub interval: Duration,
    /// How long unresolved manual conflicts are kept.
    pub conflict_retention: Duration,
}

impl StalenessSweeper {
    /// Creates a sweeper.
    pub fn new(interval: Duration, conflict_retention: Duration) -> Self {
        Self {
            interval,
            conflict_retention,
        }
    }

    /// Runs one sweep over the store and the manual conflict buffer.
    pub fn sweep<T: Clone>(
        &self,
        store: &mut DataStore<T>,
        conflicts: &mut ConflictBuffer<T>,
        now: Timestamp,
    ) -> SweepReport {
        let max_idle = store.staleness_threshold() * 2;
        let removed_keys = store.purge_idle(now, max_idle);
        let expired_conflicts = conflicts.expire(now, self.conflict_retention);
        let stale_keys = store.stale_count(now);

        if removed_keys.is_empty() && expired_conflicts == 0 {
            debug!("Sweep found nothing to remove ({} stale keys)", stale_keys);
        } else {
            info!(
                "Sweep removed {} idle keys and {} expired conflicts",
                removed_keys.len(),
                expired_conflicts
            );
        }

        SweepReport {
            removed_keys,
            expired_conflicts,
            stale_keys,
        }
    }
}

impl Default for StalenessSweeper {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(300))
    }
}
