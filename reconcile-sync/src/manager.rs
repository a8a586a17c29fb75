//! Sync manager, the service producers talk to.
//!
//! Owns the data store, the per-key conflict strategies, the update queue,
//! the subscriber hub and the manual conflict buffer. One manager is built at
//! startup and cloned into every producer; clones share state.
//!
//! All writes to a key go through a per-key async mutex held across
//! detect → resolve → commit → notify, so concurrent updates to the same key
//! never interleave and subscribers observe commits in commit order.

use crate::cache::CacheBackend;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::hub::{Subscription, SubscriptionHub};
use crate::operation::{MergeStrategy, UpdateOperation};
use crate::queue::{DEFAULT_BATCH_SIZE, DEFAULT_QUEUE_CAPACITY, UpdateQueue};
use crate::resolver::{
    ConflictBuffer, ConflictResolver, ConflictStrategy, ConflictWindows, PendingConflict,
    Resolution,
};
use crate::store::{DataStore, SynchronizedData};
use crate::sweeper::{StalenessSweeper, SweepReport};
use reconcile_types::{DataSource, Payload, SourceKind, Timestamp};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configuration for the sync manager.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Idle time after which a value reads as stale. Keys idle for twice
    /// this long are purged by the sweeper.
    pub staleness_threshold: Duration,
    /// Conflict detection windows.
    pub conflict_windows: ConflictWindows,
    /// Maximum pending queued updates per key.
    pub queue_capacity: usize,
    /// Queued updates processed per drain batch.
    pub batch_size: usize,
    /// How often the drain loop wakes.
    pub drain_interval: Duration,
    /// Pause between drain batches.
    pub batch_delay: Duration,
    /// How often the staleness sweep runs.
    pub sweep_interval: Duration,
    /// How long unresolved manual conflicts are kept.
    pub conflict_retention: Duration,
    /// Applied source versions remembered per key for append replay detection.
    pub replay_window: usize,
    /// TTL for write-through cache entries (seconds).
    pub cache_ttl_secs: u64,
    /// Prefix for cache keys.
    pub cache_prefix: String,
    /// Capacity of the global event channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(30),
            conflict_windows: ConflictWindows::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            drain_interval: Duration::from_millis(100),
            batch_delay: Duration::from_millis(10),
            sweep_interval: Duration::from_secs(60),
            conflict_retention: Duration::from_secs(300),
            replay_window: 64,
            cache_ttl_secs: 300,
            cache_prefix: "sync:".to_string(),
            event_capacity: 256,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Keys with a canonical value.
    pub total_keys: usize,
    /// Keys whose value is stale.
    pub stale_keys: usize,
    /// Updates waiting in the queue.
    pub pending_updates: usize,
    /// Updates buffered for manual resolution.
    pub conflicts: usize,
    /// Live per-key subscriptions.
    pub subscribers: usize,
}

/// The reconciliation service.
pub struct SyncManager<T: Payload = Value> {
    inner: Arc<Inner<T>>,
}

impl<T: Payload> Clone for SyncManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    config: SyncConfig,
    store: RwLock<DataStore<T>>,
    resolver: RwLock<ConflictResolver<T>>,
    conflicts: RwLock<ConflictBuffer<T>>,
    hub: RwLock<SubscriptionHub<T>>,
    queue: StdMutex<UpdateQueue<T>>,
    /// One async mutex per key, serializing read-modify-write on its slot.
    key_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Held while the queue is being drained.
    drain_lock: Mutex<()>,
    events: broadcast::Sender<SyncEvent<T>>,
    cache: Option<Arc<dyn CacheBackend>>,
    sweeper: StalenessSweeper,
    running: AtomicBool,
    /// Bumped by every `start` and `stop`; loops exit once theirs is stale.
    generation: AtomicU64,
    /// Abortable background tasks. The drain loop is not among them.
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl<T> Inner<T> {
    fn lock_queue(&self) -> MutexGuard<'_, UpdateQueue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

impl<T: Payload> SyncManager<T> {
    /// Creates a manager without a cache.
    pub fn new(config: SyncConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a manager that writes commits through to `cache`.
    pub fn with_cache(config: SyncConfig, cache: Arc<dyn CacheBackend>) -> Self {
        Self::build(config, Some(cache))
    }

    fn build(config: SyncConfig, cache: Option<Arc<dyn CacheBackend>>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Inner {
            store: RwLock::new(DataStore::new(config.staleness_threshold, config.replay_window)),
            resolver: RwLock::new(ConflictResolver::new(config.conflict_windows)),
            conflicts: RwLock::new(ConflictBuffer::new()),
            hub: RwLock::new(SubscriptionHub::new()),
            queue: StdMutex::new(UpdateQueue::new(config.queue_capacity)),
            key_locks: StdMutex::new(HashMap::new()),
            drain_lock: Mutex::new(()),
            events,
            cache,
            sweeper: StalenessSweeper::new(config.sweep_interval, config.conflict_retention),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            tasks: StdMutex::new(Vec::new()),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Subscribes to the global event topic.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent<T>> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SyncEvent<T>) {
        // No listeners is fine.
        let _ = self.inner.events.send(event);
    }

    // ── Registration & subscriptions ─────────────────────────────

    /// Registers the conflict strategy for a key, replacing any previous one.
    pub async fn register_data_key<S>(&self, key: impl Into<String>, strategy: S)
    where
        S: ConflictStrategy<T> + 'static,
    {
        let key = key.into();
        let name = strategy.name();
        let previous = self
            .inner
            .resolver
            .write()
            .await
            .register(key.clone(), Arc::new(strategy));

        match previous {
            Some(old) => info!("Key {} re-registered: {} -> {}", key, old, name),
            None => debug!("Key {} registered with {}", key, name),
        }
        self.emit(SyncEvent::KeyRegistered { key, strategy: name });
    }

    /// Name of the strategy that resolves conflicts for a key.
    pub async fn registered_strategy(&self, key: &str) -> &'static str {
        self.inner.resolver.read().await.strategy_for(key).name()
    }

    /// Registers a subscriber for a key's commits.
    pub async fn subscribe(&self, key: &str, subscriber_id: &str) -> Subscription<T> {
        self.inner.hub.write().await.subscribe(key, subscriber_id)
    }

    /// Unregisters a subscriber. Returns whether it was registered.
    pub async fn unsubscribe(&self, key: &str, subscriber_id: &str) -> bool {
        self.inner.hub.write().await.unsubscribe(key, subscriber_id)
    }

    // ── Update pipeline ──────────────────────────────────────────

    /// Validates, reconciles and (possibly) commits an update.
    ///
    /// Returns the canonical value after the update: the new value when it
    /// was committed, the unchanged existing value when the conflict strategy
    /// kept it or buffered the update for manual resolution.
    pub async fn update_data(&self, op: UpdateOperation<T>) -> SyncResult<SynchronizedData<T>> {
        if !op.is_valid() {
            warn!("Rejected update for key {}: validation failed", op.key);
            return Err(SyncError::Validation { key: op.key });
        }

        let lock = self.inner.key_lock(&op.key);
        let _guard = lock.lock().await;
        Ok(self.apply_locked(op).await)
    }

    async fn apply_locked(&self, op: UpdateOperation<T>) -> SynchronizedData<T> {
        let now = Timestamp::now();
        let (existing, replayed) = {
            let store = self.inner.store.read().await;
            let replayed = op.merge_strategy == MergeStrategy::Append
                && store.has_applied(&op.key, &op.source);
            (store.get(&op.key, now), replayed)
        };

        let Some(existing) = existing else {
            return self.commit(&op.key, op.data, op.source, true).await;
        };

        if replayed {
            debug!(
                "Dropping replayed append for key {} ({} {})",
                op.key, op.source.kind, op.source.version
            );
            return existing;
        }

        let verdict = self.inner.resolver.read().await.evaluate(&existing, &op);
        if verdict.conflict {
            info!(
                "Conflict on key {}: {} update vs {} value, {} -> {}",
                op.key,
                op.source.kind,
                existing.source.kind,
                verdict.strategy,
                verdict.resolution.label()
            );
        }

        match verdict.resolution {
            Resolution::Accept => {
                let data = op.merge_strategy.apply(Some(&existing.data), &op.data);
                self.commit(&op.key, data, op.source, true).await
            }
            Resolution::Keep => existing,
            Resolution::Replace(data) => self.commit(&op.key, data, op.source, true).await,
            Resolution::Defer => {
                let pending = PendingConflict {
                    data: op.data,
                    source: op.source,
                    received_at: now,
                };
                self.inner
                    .conflicts
                    .write()
                    .await
                    .push(&op.key, pending.clone());
                warn!("Update for key {} held for manual resolution", op.key);
                self.emit(SyncEvent::ConflictDetected {
                    key: op.key,
                    operation: pending,
                    existing: existing.clone(),
                });
                existing
            }
        }
    }

    /// Commits a value and fans it out. Caller holds the key lock.
    async fn commit(
        &self,
        key: &str,
        data: T,
        source: DataSource,
        write_through: bool,
    ) -> SynchronizedData<T> {
        let value = self
            .inner
            .store
            .write()
            .await
            .commit(key, data, source, Timestamp::now());
        let reached = self.inner.hub.write().await.notify(key, &value);
        debug!(
            "Committed key {} version {} from {} ({} subscribers)",
            key, value.version, value.source.kind, reached
        );

        self.emit(SyncEvent::DataUpdated {
            key: key.to_string(),
            data: value.clone(),
        });
        if write_through {
            self.write_through(key, &value).await;
        }
        value
    }

    /// Enqueues an update without waiting for it to be applied.
    pub fn queue_update(&self, op: UpdateOperation<T>) {
        let key = op.key.clone();
        let evicted = self.inner.lock_queue().push(op);
        if let Some(dropped) = evicted {
            debug!(
                "Queue for key {} full, evicted oldest update from {}",
                key, dropped.source.kind
            );
        }
    }

    /// Number of queued updates for a key.
    pub fn pending_updates(&self, key: &str) -> usize {
        self.inner.lock_queue().pending_for(key)
    }

    /// Drains the queue now, waiting for any running drain to finish first.
    /// Returns the number of updates processed.
    pub async fn flush_queue(&self) -> usize {
        let _drain = self.inner.drain_lock.lock().await;
        self.drain_locked(None).await
    }

    async fn drain_if_idle(&self, generation: u64) {
        let Ok(_drain) = self.inner.drain_lock.try_lock() else {
            return;
        };
        let processed = self.drain_locked(Some(generation)).await;
        if processed > 0 {
            debug!("Drained {} queued updates", processed);
        }
    }

    /// Applies queued updates batch by batch. A background drain (`generation`
    /// set) finishes the batch in hand and leaves the rest queued once the
    /// manager stops.
    async fn drain_locked(&self, generation: Option<u64>) -> usize {
        let mut processed = 0;
        loop {
            if generation.is_some_and(|g| !self.is_current(g)) {
                debug!(
                    "Drain stopped at batch boundary, {} updates left queued",
                    self.inner.lock_queue().len()
                );
                break;
            }
            let batch = self.inner.lock_queue().take_batch(self.inner.config.batch_size);
            if batch.is_empty() {
                break;
            }

            // Sequential, so same-key updates keep their queue order.
            for op in batch {
                let key = op.key.clone();
                if let Err(e) = self.update_data(op).await {
                    warn!("Queued update for key {} failed: {}", key, e);
                }
                processed += 1;
            }

            if self.inner.lock_queue().is_empty() {
                break;
            }
            tokio::time::sleep(self.inner.config.batch_delay).await;
        }
        processed
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Returns the canonical value with a freshly computed staleness flag.
    pub async fn get_data(&self, key: &str) -> Option<SynchronizedData<T>> {
        self.inner.store.read().await.get(key, Timestamp::now())
    }

    /// True if the key was never updated or is past the staleness threshold.
    pub async fn is_data_stale(&self, key: &str) -> bool {
        self.inner.store.read().await.is_stale(key, Timestamp::now())
    }

    /// Counters across all keys.
    pub async fn get_stats(&self) -> SyncStats {
        let now = Timestamp::now();
        let (total_keys, stale_keys) = {
            let store = self.inner.store.read().await;
            (store.len(), store.stale_count(now))
        };
        let pending_updates = self.inner.lock_queue().len();
        let conflicts = self.inner.conflicts.read().await.total();
        let subscribers = self.inner.hub.read().await.subscriber_count();

        SyncStats {
            total_keys,
            stale_keys,
            pending_updates,
            conflicts,
            subscribers,
        }
    }

    /// Builds a source stamped now, with an optional priority override.
    pub fn create_data_source(&self, kind: SourceKind, priority: Option<i32>) -> DataSource {
        let source = DataSource::new(kind);
        match priority {
            Some(p) => source.with_priority(p),
            None => source,
        }
    }

    // ── Clearing & manual conflicts ──────────────────────────────

    /// Removes the canonical value, queued updates and buffered conflicts for a key.
    pub async fn clear_data(&self, key: &str) {
        let lock = self.inner.key_lock(key);
        let _guard = lock.lock().await;

        let had_value = self.inner.store.write().await.remove(key).is_some();
        let dropped_updates = self.inner.lock_queue().remove_key(key);
        let dropped_conflicts = self.inner.conflicts.write().await.take(key).len();
        info!(
            "Cleared key {} (value: {}, queued: {}, conflicts: {})",
            key, had_value, dropped_updates, dropped_conflicts
        );

        self.emit(SyncEvent::DataCleared {
            key: key.to_string(),
        });
    }

    /// Updates buffered for manual resolution on a key, oldest first.
    pub async fn pending_conflicts(&self, key: &str) -> Vec<PendingConflict<T>> {
        self.inner.conflicts.read().await.get(key)
    }

    /// Commits an operator's chosen value for a key with buffered conflicts.
    ///
    /// The value is committed with an `api` source. Returns `false` when the
    /// key has nothing buffered.
    pub async fn resolve_manual_conflict(&self, key: &str, chosen: T) -> bool {
        let lock = self.inner.key_lock(key);
        let _guard = lock.lock().await;

        let discarded = self.inner.conflicts.write().await.take(key);
        if discarded.is_empty() {
            debug!("No manual conflict pending for key {}", key);
            return false;
        }

        let value = self
            .commit(key, chosen, DataSource::new(SourceKind::Api), true)
            .await;
        info!(
            "Manual conflict on key {} resolved, {} buffered updates discarded",
            key,
            discarded.len()
        );
        self.emit(SyncEvent::ConflictResolved {
            key: key.to_string(),
            resolution: value,
        });
        true
    }

    // ── Cache ────────────────────────────────────────────────────

    fn cache_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.config.cache_prefix, key)
    }

    async fn write_through(&self, key: &str, value: &SynchronizedData<T>) {
        let Some(cache) = &self.inner.cache else {
            return;
        };
        if let Err(e) = self.store_cached(cache.as_ref(), key, value).await {
            warn!("Cache write for key {} failed: {}", key, e);
        }
    }

    async fn store_cached(
        &self,
        cache: &dyn CacheBackend,
        key: &str,
        value: &SynchronizedData<T>,
    ) -> SyncResult<()> {
        let encoded = serde_json::to_value(value)?;
        cache
            .set(&self.cache_key(key), encoded, self.inner.config.cache_ttl_secs)
            .await
    }

    /// Reads and decodes the cache entry for a key without committing it.
    ///
    /// Returns `Ok(None)` when no cache is attached or the entry is missing.
    pub async fn read_cached(&self, key: &str) -> SyncResult<Option<SynchronizedData<T>>> {
        let Some(cache) = &self.inner.cache else {
            return Ok(None);
        };
        match cache.get(&self.cache_key(key)).await? {
            Some(cached) => Ok(Some(serde_json::from_value(cached)?)),
            None => Ok(None),
        }
    }

    /// Fills a missing key from the cache.
    ///
    /// Returns the canonical value if one already exists, the hydrated value
    /// on a cache hit, and `None` on a miss, a decode failure or a cache error.
    pub async fn hydrate_from_cache(&self, key: &str) -> Option<SynchronizedData<T>> {
        if self.inner.cache.is_none() {
            return None;
        }
        let lock = self.inner.key_lock(key);
        let _guard = lock.lock().await;

        if let Some(existing) = self.inner.store.read().await.get(key, Timestamp::now()) {
            return Some(existing);
        }

        let decoded = match self.read_cached(key).await {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return None,
            Err(e @ SyncError::Serialization(_)) => {
                warn!("Discarding undecodable cache entry for key {}: {}", key, e);
                return None;
            }
            Err(e) => {
                warn!("Cache read for key {} failed: {}", key, e);
                return None;
            }
        };

        let source =
            DataSource::at(SourceKind::Cache, decoded.source.timestamp).with_version(decoded.version);
        debug!("Hydrated key {} from cache", key);
        Some(self.commit(key, decoded.data, source, false).await)
    }

    // ── Sweeping ─────────────────────────────────────────────────

    /// Purges idle keys and expired manual conflicts.
    pub async fn run_cleanup(&self) -> SweepReport {
        let now = Timestamp::now();
        let report = {
            let mut store = self.inner.store.write().await;
            let mut conflicts = self.inner.conflicts.write().await;
            let report = self.inner.sweeper.sweep(&mut store, &mut conflicts, now);

            // Locks nobody holds for keys that no longer exist.
            self.inner
                .key_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|key, lock| Arc::strong_count(lock) > 1 || store.peek(key).is_some());
            report
        };

        self.emit(SyncEvent::CleanupCompleted {
            removed_keys: report.removed_keys.clone(),
            expired_conflicts: report.expired_conflicts,
        });
        report
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Whether the background loops are running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.is_running() && self.inner.generation.load(Ordering::SeqCst) == generation
    }

    /// Spawns the drain loop and the staleness sweeper.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Detached: aborting it mid-batch would drop updates already taken
        // off the queue. It exits on its own at the next batch boundary.
        drop(Self::spawn_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.drain_interval,
            generation,
            move |manager| async move { manager.drain_if_idle(generation).await },
        ));
        let sweep = Self::spawn_loop(
            Arc::downgrade(&self.inner),
            self.inner.sweeper.interval,
            generation,
            |manager| async move {
                manager.run_cleanup().await;
            },
        );

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sweep);
        info!(
            "Sync manager started (drain every {:?}, sweep every {:?})",
            self.inner.config.drain_interval, self.inner.sweeper.interval
        );
    }

    /// Stops the background loops. A drain in progress finishes its current
    /// batch; everything after it stays queued for the next `start` or
    /// [`flush_queue`](Self::flush_queue).
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        info!("Sync manager stopped");
    }

    /// Runs `tick` every `period` until `generation` is superseded or the
    /// manager is dropped.
    fn spawn_loop<F, Fut>(
        weak: Weak<Inner<T>>,
        period: Duration,
        generation: u64,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(SyncManager<T>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = SyncManager { inner };
                if !manager.is_current(generation) {
                    break;
                }
                tick(manager).await;
            }
        })
    }
}
