use pretty_assertions::assert_eq;
use reconcile_tracer::{
    NewOperation, OperationKind, OperationStatus, RaceResolution, RaceType, Severity,
};
use reconcile_types::Timestamp;
use serde_json::json;

// ── OperationKind ────────────────────────────────────────────────

#[test]
fn kind_names() {
    assert_eq!(OperationKind::ApiFetch.as_str(), "api_fetch");
    assert_eq!(OperationKind::RealtimeUpdate.as_str(), "realtime_update");
    assert_eq!(OperationKind::CacheRead.as_str(), "cache_read");
    assert_eq!(OperationKind::CacheWrite.as_str(), "cache_write");
    assert_eq!(OperationKind::Custom("reindex".into()).to_string(), "reindex");
}

#[test]
fn only_cache_kinds_are_cache() {
    assert!(OperationKind::CacheRead.is_cache());
    assert!(OperationKind::CacheWrite.is_cache());
    assert!(!OperationKind::ApiFetch.is_cache());
    assert!(!OperationKind::Custom("cache".into()).is_cache());
}

#[test]
fn kind_serializes_snake_case() {
    assert_eq!(
        serde_json::to_value(OperationKind::RealtimeUpdate).unwrap(),
        json!("realtime_update")
    );
    assert_eq!(
        serde_json::to_value(OperationKind::Custom("x".into())).unwrap(),
        json!({"custom": "x"})
    );
}

// ── OperationStatus ──────────────────────────────────────────────

#[test]
fn terminal_statuses() {
    assert!(!OperationStatus::Pending.is_terminal());
    assert!(OperationStatus::Completed.is_terminal());
    assert!(OperationStatus::Failed.is_terminal());
    assert_eq!(OperationStatus::Failed.to_string(), "failed");
}

// ── NewOperation ─────────────────────────────────────────────────

#[test]
fn builder_sets_fields() {
    let at = Timestamp::from_millis(1_700_000_000_000);
    let op = NewOperation::new(OperationKind::ApiFetch, "price")
        .with_source("poller")
        .with_metadata("attempt", json!(2))
        .started_at(at);

    assert_eq!(op.key, "price");
    assert_eq!(op.source, "poller");
    assert_eq!(op.metadata["attempt"], json!(2));
    assert_eq!(op.started_at, Some(at));
}

// ── Race enums ───────────────────────────────────────────────────

#[test]
fn race_enums_serialize_to_contract_names() {
    assert_eq!(
        serde_json::to_value(RaceType::ConcurrentUpdates).unwrap(),
        json!("concurrent_updates")
    );
    assert_eq!(
        serde_json::to_value(RaceType::StaleDataOverride).unwrap(),
        json!("stale_data_override")
    );
    assert_eq!(serde_json::to_value(Severity::Critical).unwrap(), json!("critical"));
    assert_eq!(serde_json::to_value(RaceResolution::Ignored).unwrap(), json!("ignored"));
    assert_eq!(RaceType::CircularDependency.to_string(), "circular_dependency");
}

#[test]
fn severities_are_ordered() {
    assert!(Severity::Low < Severity::Medium);
    assert!(Severity::High < Severity::Critical);
}
