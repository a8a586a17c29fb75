//! Multi-source state reconciliation.
//!
//! Several producers (a realtime feed, an API poller, a cache) report values
//! for the same logical keys at overlapping times. This crate keeps exactly
//! one canonical value per key and tells interested consumers every time it
//! changes.
//!
//! # Architecture
//!
//! - **Store**: one versioned [`SynchronizedData`] per key, with staleness
//!   computed on read
//! - **Resolver**: detects conflicting sources and applies the key's
//!   [`ConflictStrategy`]
//! - **Queue**: bounded per-key buffer so producers never wait
//! - **Hub**: per-key subscriber fan-out in commit order
//! - **Sweeper**: purges idle keys and expired manual conflicts
//! - **Manager**: the [`SyncManager`] service wiring all of the above
//!
//! ## Update pipeline
//!
//! 1. **Validate**: a rejecting validator aborts the update
//! 2. **Detect**: compare the incoming source with the existing value's
//! 3. **Resolve**: accept, keep, replace or defer per the key's strategy
//! 4. **Commit**: store a new version with the update's source
//! 5. **Notify**: deliver to subscribers, publish `data_updated`
//!
//! # Example
//!
//! ```
//! use reconcile_sync::{PriorityBased, SyncConfig, SyncManager, UpdateOperation};
//! use reconcile_types::{DataSource, SourceKind};
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let manager: SyncManager = SyncManager::new(SyncConfig::default());
//! manager.register_data_key("price", PriorityBased).await;
//!
//! let op = UpdateOperation::new("price", json!(101), DataSource::new(SourceKind::Realtime));
//! let committed = manager.update_data(op).await.unwrap();
//! assert_eq!(committed.data, json!(101));
//! # });
//! ```

pub mod cache;
mod error;
pub mod events;
pub mod hub;
mod manager;
pub mod operation;
pub mod queue;
pub mod resolver;
pub mod store;
pub mod sweeper;

pub use cache::CacheBackend;
pub use cache::memory::MemoryCache;
pub use error::{SyncError, SyncResult};
pub use events::SyncEvent;
pub use hub::{Subscription, SubscriptionHub};
pub use manager::{SyncConfig, SyncManager, SyncStats};
pub use operation::{MergeStrategy, UpdateOperation, Validator};
pub use queue::{DEFAULT_BATCH_SIZE, DEFAULT_QUEUE_CAPACITY, UpdateQueue};
pub use resolver::{
    ConflictBuffer, ConflictResolver, ConflictStrategy, ConflictWindows, LatestWins, Manual,
    MergeFn, MergeWith, PendingConflict, PriorityBased, Resolution, Verdict, detect_conflict,
};
pub use store::{DataStore, SynchronizedData};
pub use sweeper::{StalenessSweeper, SweepReport};
