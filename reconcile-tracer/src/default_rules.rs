//! The built-in detection rules.

use crate::race::{RaceType, Severity};
use crate::rules::{DetectionRule, Remediation, RuleContext};
use crate::trace::{OperationKind, OperationStatus, OperationTrace};
use std::time::Duration;

/// A completed api fetch this recent makes older pending realtime updates stale.
pub const STALE_OVERRIDE_WINDOW: Duration = Duration::from_secs(5);

/// Window in which more than [`RAPID_OPERATION_LIMIT`] starts count as rapid.
pub const RAPID_WINDOW: Duration = Duration::from_secs(1);

pub const RAPID_OPERATION_LIMIT: usize = 3;

/// A cache read starting this soon after a cache write follows it immediately.
pub const CACHE_FOLLOW_WINDOW: Duration = Duration::from_millis(100);

pub const CACHE_OPERATION_LIMIT: usize = 4;

/// All built-in rules in evaluation order.
pub fn default_rules() -> Vec<DetectionRule> {
    vec![
        concurrent_api_calls(),
        stale_websocket_override(),
        rapid_successive_operations(),
        circular_cache_dependency(),
    ]
}

/// Two or more api fetches pending on one key. Keeps the latest-started one
/// and cancels the rest.
pub fn concurrent_api_calls() -> DetectionRule {
    DetectionRule::new(
        "concurrent_api_calls",
        "Concurrent API calls",
        RaceType::ConcurrentUpdates,
        Severity::Medium,
        |ctx| ctx.pending(OperationKind::ApiFetch).count() >= 2,
    )
    .with_description("multiple api fetches are in flight for the same key")
    .with_resolver(|ctx| {
        let pending: Vec<&OperationTrace> = ctx.pending(OperationKind::ApiFetch).collect();
        let Some(latest) = pending.iter().max_by_key(|t| (t.timestamp, t.id)) else {
            return Vec::new();
        };
        pending
            .iter()
            .filter(|t| t.id != latest.id)
            .map(|t| Remediation::Fail {
                id: t.id,
                error: format!("cancelled: superseded by concurrent api call {}", latest.id),
            })
            .collect()
    })
}

/// Api fetches that completed within [`STALE_OVERRIDE_WINDOW`].
fn recent_fetches(ctx: &RuleContext) -> impl Iterator<Item = &OperationTrace> {
    let now = ctx.now;
    ctx.of_kind(OperationKind::ApiFetch).filter(move |t| {
        t.status == OperationStatus::Completed
            && t
                .finished_at
                .is_some_and(|at| now.since(at) <= STALE_OVERRIDE_WINDOW)
    })
}

/// Pending realtime updates that started before a fresh api fetch.
fn stale_realtime(ctx: &RuleContext) -> Vec<(&OperationTrace, &OperationTrace)> {
    ctx.pending(OperationKind::RealtimeUpdate)
        .filter_map(|update| {
            recent_fetches(ctx)
                .find(|fetch| update.timestamp < fetch.timestamp)
                .map(|fetch| (update, fetch))
        })
        .collect()
}

/// A pending realtime update older than a just-completed api fetch would
/// overwrite fresher data. Cancels the realtime update.
pub fn stale_websocket_override() -> DetectionRule {
    DetectionRule::new(
        "stale_websocket_override",
        "Stale websocket override",
        RaceType::StaleDataOverride,
        Severity::High,
        |ctx| !stale_realtime(ctx).is_empty(),
    )
    .with_description("a realtime update started before a fresher api fetch completed")
    .with_resolver(|ctx| {
        stale_realtime(ctx)
            .into_iter()
            .map(|(update, fetch)| Remediation::Fail {
                id: update.id,
                error: format!("cancelled: stale realtime update superseded by api fetch {}", fetch.id),
            })
            .collect()
    })
}

/// More than [`RAPID_OPERATION_LIMIT`] operations started within
/// [`RAPID_WINDOW`]. Flag only.
pub fn rapid_successive_operations() -> DetectionRule {
    DetectionRule::new(
        "rapid_successive_operations",
        "Rapid successive operations",
        RaceType::ConcurrentUpdates,
        Severity::Low,
        |ctx| {
            ctx.traces
                .iter()
                .filter(|t| ctx.now.since(t.timestamp) < RAPID_WINDOW)
                .count()
                > RAPID_OPERATION_LIMIT
        },
    )
    .with_description("operations on the key are starting faster than they can settle")
}

/// A cache write immediately followed by a cache read, on a key with more
/// than [`CACHE_OPERATION_LIMIT`] cache operations. Flag only.
pub fn circular_cache_dependency() -> DetectionRule {
    DetectionRule::new(
        "circular_cache_dependency",
        "Circular cache dependency",
        RaceType::CircularDependency,
        Severity::Medium,
        |ctx| {
            let cache_ops: Vec<&OperationTrace> =
                ctx.traces.iter().filter(|t| t.kind.is_cache()).collect();
            if cache_ops.len() <= CACHE_OPERATION_LIMIT {
                return false;
            }
            cache_ops.windows(2).any(|pair| {
                pair[0].kind == OperationKind::CacheWrite
                    && pair[1].kind == OperationKind::CacheRead
                    && pair[1].timestamp.since(pair[0].timestamp) < CACHE_FOLLOW_WINDOW
            })
        },
    )
    .with_description("cache writes are immediately read back, suggesting a feedback loop")
}
