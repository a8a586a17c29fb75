use pretty_assertions::assert_eq;
use reconcile_sim::{SimConfig, run};
use reconcile_tracer::RaceType;
use std::time::Duration;

fn quick_config(keys: &[&str]) -> SimConfig {
    SimConfig {
        duration: Duration::from_millis(400),
        keys: keys.iter().map(|k| k.to_string()).collect(),
        realtime_interval: Duration::from_millis(10),
        api_interval: Duration::from_millis(20),
        api_latency: Duration::from_millis(60),
        cache_interval: Duration::from_millis(15),
        ..Default::default()
    }
}

// ── Validation ───────────────────────────────────────────────────

#[tokio::test]
async fn no_keys_is_rejected() {
    let err = run(quick_config(&[])).await.unwrap_err();
    assert!(err.to_string().contains("at least one key"));
}

#[tokio::test]
async fn zero_interval_is_rejected() {
    let config = SimConfig {
        api_interval: Duration::ZERO,
        ..quick_config(&["k"])
    };
    assert!(run(config).await.is_err());
}

// ── Workload ─────────────────────────────────────────────────────

#[tokio::test]
async fn every_producer_does_work() {
    let report = run(quick_config(&["price:btc", "price:eth"])).await.unwrap();

    assert!(report.producers.realtime_updates > 0);
    assert!(report.producers.api_fetches > 0);
    let reads = report.producers.cache_hits
        + report.producers.cache_hydrations
        + report.producers.cache_misses;
    assert!(reads > 0);
    assert!(report.notifications > 0);
    assert_eq!(report.sync.total_keys, 2);
    assert_eq!(report.values.len(), 2);
    assert_eq!(report.sync.pending_updates, 0);
}

#[tokio::test]
async fn all_traces_settle_by_the_end() {
    let report = run(quick_config(&["k"])).await.unwrap();
    assert_eq!(report.tracer.active, 0);
}

#[tokio::test]
async fn overlapping_fetches_are_cancelled() {
    let report = run(quick_config(&["user:1"])).await.unwrap();

    assert!(report.producers.api_cancelled > 0);
    assert!(
        report
            .races
            .iter()
            .any(|r| r.rule_id == "concurrent_api_calls" && r.race_type == RaceType::ConcurrentUpdates)
    );
}

#[tokio::test]
async fn report_serializes_as_json() {
    let report = run(quick_config(&["k"])).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();

    for field in ["elapsed_ms", "producers", "notifications", "values", "sync", "tracer", "races"] {
        assert!(json.get(field).is_some(), "missing {field}");
    }
    assert_eq!(json["sync"]["total_keys"], 1);
}
