//! Conflict detection and resolution.
//!
//! Detection is a heuristic over the two sources involved: updates that land
//! close together from different channels, or a less trusted source trying
//! to overwrite a more trusted one shortly after, are treated as conflicting.
//! Everything else commits directly.
//!
//! Resolution is delegated to a [`ConflictStrategy`] registered per key.
//! Keys without a registration resolve with [`LatestWins`].

use crate::operation::UpdateOperation;
use crate::store::SynchronizedData;
use reconcile_types::{DataSource, Timestamp};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Time windows used by conflict detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictWindows {
    /// Updates from different channels closer than this conflict.
    pub simultaneity: Duration,
    /// A lower-priority update closer than this to a higher-priority one conflicts.
    pub priority: Duration,
}

impl Default for ConflictWindows {
    fn default() -> Self {
        Self {
            simultaneity: Duration::from_millis(1_000),
            priority: Duration::from_millis(5_000),
        }
    }
}

/// Decides whether `incoming` conflicts with the source of the existing value.
pub fn detect_conflict(
    incoming: &DataSource,
    existing: &DataSource,
    windows: &ConflictWindows,
) -> bool {
    let gap = incoming.timestamp.abs_diff(existing.timestamp);

    let simultaneous = gap < windows.simultaneity && incoming.kind != existing.kind;
    let outranked = incoming.priority < existing.priority && gap < windows.priority;

    simultaneous || outranked
}

/// Outcome of resolving a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// Commit the incoming operation through the standard update path.
    Accept,
    /// Keep the existing value. Nothing is committed or notified.
    Keep,
    /// Commit this value in place of the incoming data.
    Replace(T),
    /// Buffer the operation until an operator resolves it.
    Defer,
}

impl<T> Resolution<T> {
    /// Short name of the outcome, for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Keep => "keep",
            Self::Replace(_) => "replace",
            Self::Defer => "defer",
        }
    }
}

/// A per-key conflict resolution policy.
pub trait ConflictStrategy<T>: Send + Sync {
    /// Stable strategy name (`latest_wins`, `priority_based`, ...).
    fn name(&self) -> &'static str;

    /// Resolves a detected conflict between the canonical value and an update.
    fn resolve(&self, existing: &SynchronizedData<T>, incoming: &UpdateOperation<T>) -> Resolution<T>;
}

/// Accepts the incoming update only if it was observed strictly later.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestWins;

impl<T> ConflictStrategy<T> for LatestWins {
    fn name(&self) -> &'static str {
        "latest_wins"
    }

    fn resolve(&self, existing: &SynchronizedData<T>, incoming: &UpdateOperation<T>) -> Resolution<T> {
        if incoming.source.timestamp > existing.source.timestamp {
            Resolution::Accept
        } else {
            Resolution::Keep
        }
    }
}

/// Accepts the incoming update only if its source strictly outranks the existing one.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityBased;

impl<T> ConflictStrategy<T> for PriorityBased {
    fn name(&self) -> &'static str {
        "priority_based"
    }

    fn resolve(&self, existing: &SynchronizedData<T>, incoming: &UpdateOperation<T>) -> Resolution<T> {
        if incoming.source.priority > existing.source.priority {
            Resolution::Accept
        } else {
            Resolution::Keep
        }
    }
}

/// Custom merge function: `(existing, incoming) -> merged`.
pub type MergeFn<T> = Arc<dyn Fn(&T, &T) -> T + Send + Sync>;

/// Merges both values with a custom function. Without one, the update goes
/// through the standard path using the operation's own merge strategy.
pub struct MergeWith<T> {
    resolver: Option<MergeFn<T>>,
}

impl<T> MergeWith<T> {
    /// Merges with the given function.
    pub fn new(resolver: impl Fn(&T, &T) -> T + Send + Sync + 'static) -> Self {
        Self {
            resolver: Some(Arc::new(resolver)),
        }
    }

    /// No custom function; conflicts fall through to the operation's strategy.
    pub fn passthrough() -> Self {
        Self { resolver: None }
    }
}

impl<T> fmt::Debug for MergeWith<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeWith")
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl<T: Send + Sync> ConflictStrategy<T> for MergeWith<T> {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn resolve(&self, existing: &SynchronizedData<T>, incoming: &UpdateOperation<T>) -> Resolution<T> {
        match &self.resolver {
            Some(merge) => Resolution::Replace(merge(&existing.data, &incoming.data)),
            None => Resolution::Accept,
        }
    }
}

/// Holds conflicting updates until an operator picks a value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Manual;

impl<T> ConflictStrategy<T> for Manual {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn resolve(&self, _existing: &SynchronizedData<T>, _incoming: &UpdateOperation<T>) -> Resolution<T> {
        Resolution::Defer
    }
}

/// What the resolver decided for one update.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict<T> {
    /// Whether a conflict was detected.
    pub conflict: bool,
    /// Name of the strategy consulted.
    pub strategy: &'static str,
    /// The outcome. `Accept` when there was no conflict.
    pub resolution: Resolution<T>,
}

/// Pure policy evaluator: per-key strategies plus the detection windows.
pub struct ConflictResolver<T> {
    strategies: HashMap<String, Arc<dyn ConflictStrategy<T>>>,
    fallback: Arc<dyn ConflictStrategy<T>>,
    windows: ConflictWindows,
}

impl<T: 'static> ConflictResolver<T> {
    /// Creates a resolver with no registrations.
    pub fn new(windows: ConflictWindows) -> Self {
        Self {
            strategies: HashMap::new(),
            fallback: Arc::new(LatestWins),
            windows,
        }
    }

    /// Returns the detection windows.
    pub fn windows(&self) -> &ConflictWindows {
        &self.windows
    }

    /// Registers the strategy for a key, returning the name of the one it replaced.
    pub fn register(
        &mut self,
        key: impl Into<String>,
        strategy: Arc<dyn ConflictStrategy<T>>,
    ) -> Option<&'static str> {
        self.strategies
            .insert(key.into(), strategy)
            .map(|previous| previous.name())
    }

    /// Removes the registration for a key.
    pub fn unregister(&mut self, key: &str) -> bool {
        self.strategies.remove(key).is_some()
    }

    /// Returns the strategy that applies to a key.
    pub fn strategy_for(&self, key: &str) -> &Arc<dyn ConflictStrategy<T>> {
        self.strategies.get(key).unwrap_or(&self.fallback)
    }

    /// Whether a key has an explicit registration.
    pub fn is_registered(&self, key: &str) -> bool {
        self.strategies.contains_key(key)
    }

    /// Evaluates an update against the canonical value.
    pub fn evaluate(&self, existing: &SynchronizedData<T>, incoming: &UpdateOperation<T>) -> Verdict<T> {
        let strategy = self.strategy_for(&incoming.key);

        if !detect_conflict(&incoming.source, &existing.source, &self.windows) {
            return Verdict {
                conflict: false,
                strategy: strategy.name(),
                resolution: Resolution::Accept,
            };
        }

        let resolution = strategy.resolve(existing, incoming);
        debug!(
            "Conflict on key {} ({} -> {}), {} chose {:?}",
            incoming.key,
            existing.source.kind,
            incoming.source.kind,
            strategy.name(),
            resolution.label()
        );
        Verdict {
            conflict: true,
            strategy: strategy.name(),
            resolution,
        }
    }
}

// ── Manual conflict buffer ───────────────────────────────────────

/// An update held back for manual resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConflict<T> {
    /// The rejected data.
    pub data: T,
    /// Where it came from.
    pub source: DataSource,
    /// When it was buffered.
    pub received_at: Timestamp,
}

/// Per-key buffer of updates awaiting an operator decision.
#[derive(Debug)]
pub struct ConflictBuffer<T> {
    pending: HashMap<String, VecDeque<PendingConflict<T>>>,
}

impl<T: Clone> ConflictBuffer<T> {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Buffers an update for a key.
    pub fn push(&mut self, key: &str, conflict: PendingConflict<T>) {
        self.pending
            .entry(key.to_string())
            .or_default()
            .push_back(conflict);
    }

    /// Returns the buffered updates for a key, oldest first.
    pub fn get(&self, key: &str) -> Vec<PendingConflict<T>> {
        self.pending
            .get(key)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes and returns everything buffered for a key.
    pub fn take(&mut self, key: &str) -> Vec<PendingConflict<T>> {
        self.pending
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Total number of buffered updates.
    pub fn total(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Drops buffered updates older than `retention`. Returns how many were dropped.
    pub fn expire(&mut self, now: Timestamp, retention: Duration) -> usize {
        let mut dropped = 0;
        self.pending.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|c| now.since(c.received_at) <= retention);
            dropped += before - queue.len();
            !queue.is_empty()
        });
        dropped
    }
}

impl<T: Clone> Default for ConflictBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
