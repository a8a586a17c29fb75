//! The canonical data store.
//!
//! Holds exactly one [`SynchronizedData`] per key: the last value the
//! pipeline accepted, together with the source that produced it. Values are
//! replaced on commit, never mutated in place. The store itself is not
//! synchronized; the manager owns it behind a lock and serializes writers
//! per key.

use reconcile_types::{DataSource, SourceKind, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// The canonical value for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizedData<T> {
    /// The data itself.
    pub data: T,
    /// Source of the update that produced this value.
    pub source: DataSource,
    /// Whether the value is older than the staleness threshold.
    /// Computed when the value is read, never stored.
    #[serde(default)]
    pub is_stale: bool,
    /// When the value was committed.
    pub last_updated: Timestamp,
    /// Unique version of this commit.
    pub version: Version,
}

/// Versioned key → value map.
#[derive(Debug)]
pub struct DataStore<T> {
    /// Canonical value per key.
    entries: HashMap<String, SynchronizedData<T>>,
    /// Recently applied sources per key, used to drop replayed appends.
    applied: HashMap<String, VecDeque<(SourceKind, Version)>>,
    /// Idle time after which a value counts as stale.
    staleness_threshold: Duration,
    /// How many applied sources to remember per key.
    replay_window: usize,
}

impl<T: Clone> DataStore<T> {
    /// Creates an empty store.
    pub fn new(staleness_threshold: Duration, replay_window: usize) -> Self {
        Self {
            entries: HashMap::new(),
            applied: HashMap::new(),
            staleness_threshold,
            replay_window,
        }
    }

    /// Returns the staleness threshold.
    pub fn staleness_threshold(&self) -> Duration {
        self.staleness_threshold
    }

    /// Returns a copy of the canonical value with `is_stale` computed at `now`.
    pub fn get(&self, key: &str, now: Timestamp) -> Option<SynchronizedData<T>> {
        self.entries.get(key).map(|entry| {
            let mut value = entry.clone();
            value.is_stale = self.is_entry_stale(entry, now);
            value
        })
    }

    /// Returns the stored value without recomputing staleness.
    pub fn peek(&self, key: &str) -> Option<&SynchronizedData<T>> {
        self.entries.get(key)
    }

    /// True if the key was never committed or has been idle past the threshold.
    pub fn is_stale(&self, key: &str, now: Timestamp) -> bool {
        self.entries
            .get(key)
            .is_none_or(|entry| self.is_entry_stale(entry, now))
    }

    fn is_entry_stale(&self, entry: &SynchronizedData<T>, now: Timestamp) -> bool {
        now.since(entry.last_updated) > self.staleness_threshold
    }

    /// Replaces the canonical value for `key` and returns the new value.
    pub fn commit(
        &mut self,
        key: &str,
        data: T,
        source: DataSource,
        now: Timestamp,
    ) -> SynchronizedData<T> {
        self.remember_source(key, &source);
        let value = SynchronizedData {
            data,
            source,
            is_stale: false,
            last_updated: now,
            version: Version::generate(),
        };
        self.entries.insert(key.to_string(), value.clone());
        value
    }

    /// Whether a source with this kind and version was already applied to `key`.
    pub fn has_applied(&self, key: &str, source: &DataSource) -> bool {
        self.applied.get(key).is_some_and(|seen| {
            seen.iter()
                .any(|(kind, version)| *kind == source.kind && *version == source.version)
        })
    }

    fn remember_source(&mut self, key: &str, source: &DataSource) {
        if self.replay_window == 0 {
            return;
        }
        let seen = self.applied.entry(key.to_string()).or_default();
        if seen.len() >= self.replay_window {
            seen.pop_front();
        }
        seen.push_back((source.kind, source.version.clone()));
    }

    /// Removes all state for a key.
    pub fn remove(&mut self, key: &str) -> Option<SynchronizedData<T>> {
        self.applied.remove(key);
        self.entries.remove(key)
    }

    /// Number of keys with a canonical value.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns all keys.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Number of stale keys at `now`.
    pub fn stale_count(&self, now: Timestamp) -> usize {
        self.entries
            .values()
            .filter(|entry| self.is_entry_stale(entry, now))
            .count()
    }

    /// Removes every key idle for longer than `max_idle` and returns their names.
    pub fn purge_idle(&mut self, now: Timestamp, max_idle: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.since(entry.last_updated) > max_idle)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired
    }
}
