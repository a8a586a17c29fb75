use reconcile_sync::DataStore;
use reconcile_types::{DataSource, SourceKind, Timestamp};
use serde_json::{Value, json};
use std::time::Duration;

fn make_store() -> DataStore<Value> {
    DataStore::new(Duration::from_secs(30), 4)
}

fn t(millis: u64) -> Timestamp {
    Timestamp::from_millis(1_700_000_000_000 + millis)
}

// ── Commit & read ────────────────────────────────────────────────

#[test]
fn missing_key_reads_none_and_stale() {
    let store = make_store();
    assert!(store.get("nope", t(0)).is_none());
    assert!(store.is_stale("nope", t(0)));
    assert!(store.is_empty());
}

#[test]
fn commit_replaces_value_and_bumps_version() {
    let mut store = make_store();
    let first = store.commit("k", json!(1), DataSource::new(SourceKind::Api), t(0));
    let second = store.commit("k", json!(2), DataSource::new(SourceKind::Realtime), t(10));

    assert_ne!(first.version, second.version);
    let current = store.get("k", t(10)).unwrap();
    assert_eq!(current.data, json!(2));
    assert_eq!(current.source.kind, SourceKind::Realtime);
    assert_eq!(current.last_updated, t(10));
    assert_eq!(store.len(), 1);
}

#[test]
fn staleness_is_computed_on_read() {
    let mut store = make_store();
    store.commit("k", json!(1), DataSource::new(SourceKind::Api), t(0));

    assert!(!store.get("k", t(30_000)).unwrap().is_stale);
    assert!(store.get("k", t(30_001)).unwrap().is_stale);
    assert!(store.is_stale("k", t(30_001)));
    assert!(!store.peek("k").unwrap().is_stale);
}

#[test]
fn stale_count_counts_only_idle_keys() {
    let mut store = make_store();
    store.commit("old", json!(1), DataSource::new(SourceKind::Api), t(0));
    store.commit("new", json!(2), DataSource::new(SourceKind::Api), t(20_000));

    assert_eq!(store.stale_count(t(40_000)), 1);
    assert_eq!(store.stale_count(t(10_000)), 0);
}

#[test]
fn remove_clears_value() {
    let mut store = make_store();
    let source = DataSource::new(SourceKind::Api);
    store.commit("k", json!(1), source.clone(), t(0));

    assert!(store.remove("k").is_some());
    assert!(store.get("k", t(0)).is_none());
    assert!(!store.has_applied("k", &source));
    assert!(store.remove("k").is_none());
}

// ── Replay window ────────────────────────────────────────────────

#[test]
fn applied_sources_are_remembered() {
    let mut store = make_store();
    let source = DataSource::new(SourceKind::Realtime).with_version("seq-1");
    store.commit("k", json!([1]), source.clone(), t(0));

    assert!(store.has_applied("k", &source));
    assert!(!store.has_applied("other", &source));

    let same_version_other_kind = DataSource::new(SourceKind::Api).with_version("seq-1");
    assert!(!store.has_applied("k", &same_version_other_kind));
}

#[test]
fn replay_window_forgets_oldest() {
    let mut store = make_store();
    let sources: Vec<_> = (0..5)
        .map(|i| DataSource::new(SourceKind::Realtime).with_version(format!("seq-{i}")))
        .collect();
    for (i, source) in sources.iter().enumerate() {
        store.commit("k", json!(i), source.clone(), t(i as u64));
    }

    assert!(!store.has_applied("k", &sources[0]));
    assert!(sources[1..].iter().all(|s| store.has_applied("k", s)));
}

// ── Purging ──────────────────────────────────────────────────────

#[test]
fn purge_idle_removes_only_expired_keys() {
    let mut store = make_store();
    store.commit("old", json!(1), DataSource::new(SourceKind::Api), t(0));
    store.commit("new", json!(2), DataSource::new(SourceKind::Api), t(50_000));

    let removed = store.purge_idle(t(70_000), Duration::from_secs(60));
    assert_eq!(removed, vec!["old".to_string()]);
    assert!(store.get("old", t(70_000)).is_none());
    assert!(store.get("new", t(70_000)).is_some());
}

#[test]
fn synchronized_data_serde_roundtrip() {
    let mut store = make_store();
    let value = store.commit("k", json!({"a": 1}), DataSource::new(SourceKind::Cache), t(5));

    let encoded = serde_json::to_value(&value).unwrap();
    let decoded: reconcile_sync::SynchronizedData<Value> = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, value);
}
