//! Cache backend abstraction.
//!
//! The manager writes every commit through to an optional cache and can
//! hydrate a missing key from it. The cache is never required for
//! correctness: every failure is logged by the caller and ignored.

use crate::error::SyncResult;
use async_trait::async_trait;
use serde_json::Value;

/// A key/value cache with per-entry TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reads a value. `Ok(None)` on a miss or an expired entry.
    async fn get(&self, key: &str) -> SyncResult<Option<Value>>;

    /// Writes a value that expires after `ttl_secs`.
    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> SyncResult<()>;
}

/// An in-process cache for tests and single-node deployments.
pub mod memory {
    use super::*;
    use crate::error::SyncError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::{Duration, Instant};

    /// A `HashMap` cache with lazy expiry. An entry whose TTL runs past the
    /// clock's range never expires.
    #[derive(Debug, Default)]
    pub struct MemoryCache {
        entries: Mutex<HashMap<String, (Value, Option<Instant>)>>,
        unavailable: AtomicBool,
    }

    impl MemoryCache {
        /// Creates an empty cache.
        pub fn new() -> Self {
            Self::default()
        }

        /// Simulates an outage: while set, every call fails.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Number of live entries.
        pub fn len(&self) -> usize {
            let now = Instant::now();
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .filter(|(_, expires)| is_live(*expires, now))
                .count()
        }

        /// Whether the cache holds no live entries.
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        fn check_available(&self) -> SyncResult<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(SyncError::Cache("cache unavailable".to_string()));
            }
            Ok(())
        }
    }

    fn is_live(expires: Option<Instant>, now: Instant) -> bool {
        expires.is_none_or(|at| at > now)
    }

    #[async_trait]
    impl CacheBackend for MemoryCache {
        async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
            self.check_available()?;
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some((value, expires)) if is_live(*expires, Instant::now()) => Ok(Some(value.clone())),
                Some(_) => {
                    entries.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        }

        async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> SyncResult<()> {
            self.check_available()?;
            let expires = Instant::now().checked_add(Duration::from_secs(ttl_secs));
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.to_string(), (value, expires));
            Ok(())
        }
    }
}
