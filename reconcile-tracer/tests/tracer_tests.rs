use pretty_assertions::assert_eq;
use reconcile_tracer::{
    DetectionRule, NewOperation, OperationKind, OperationStatus, OperationTracer, RaceResolution,
    RaceType, Severity, TraceSweepReport, TracerConfig, TracerError, TracerEvent,
};
use reconcile_types::{RaceId, Timestamp, TraceId};
use serde_json::{Map, json};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

fn make_tracer() -> OperationTracer {
    OperationTracer::new(TracerConfig::default())
}

fn op(kind: OperationKind, key: &str) -> NewOperation {
    NewOperation::new(kind, key)
}

fn secs_ago(secs: u64) -> Timestamp {
    Timestamp::now() - Duration::from_secs(secs)
}

/// Names of the events already published.
fn drain_names(rx: &mut broadcast::Receiver<TracerEvent>) -> Vec<&'static str> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        names.push(event.name());
    }
    names
}

async fn expect_event(rx: &mut broadcast::Receiver<TracerEvent>, name: &str) -> TracerEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.name() == name {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {name} event"))
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn start_records_pending_trace() {
    let tracer = make_tracer();
    let mut events = tracer.subscribe_events();

    let id = tracer
        .start_operation(op(OperationKind::CacheRead, "user:1").with_source("loader"))
        .await;

    let trace = tracer.get_operation(id).await.unwrap();
    assert_eq!(trace.status, OperationStatus::Pending);
    assert_eq!(trace.key, "user:1");
    assert_eq!(trace.source, "loader");
    assert_eq!(tracer.active_operations().await.len(), 1);
    assert_eq!(drain_names(&mut events), vec!["operation_started"]);
}

#[tokio::test]
async fn complete_sets_duration_and_merges_metadata() {
    let tracer = make_tracer();
    let id = tracer
        .start_operation(op(OperationKind::ApiFetch, "k").with_metadata("attempt", json!(1)))
        .await;

    let mut extra = Map::new();
    extra.insert("status".to_string(), json!(200));
    let trace = tracer
        .complete_operation(id, Some(Duration::from_millis(120)), Some(extra))
        .await
        .unwrap();

    assert_eq!(trace.status, OperationStatus::Completed);
    assert_eq!(trace.duration_ms, Some(120));
    assert_eq!(trace.metadata["attempt"], json!(1));
    assert_eq!(trace.metadata["status"], json!(200));
    assert!(trace.finished_at.is_some());
    assert!(tracer.active_operations().await.is_empty());
}

#[tokio::test]
async fn finished_trace_cannot_finish_again() {
    let tracer = make_tracer();
    let id = tracer.start_operation(op(OperationKind::ApiFetch, "k")).await;
    tracer.complete_operation(id, None, None).await.unwrap();

    let err = tracer.fail_operation(id, None).await.unwrap_err();
    assert!(matches!(
        err,
        TracerError::AlreadyFinished { status: OperationStatus::Completed, .. }
    ));
    let err = tracer.complete_operation(id, None, None).await.unwrap_err();
    assert!(matches!(err, TracerError::AlreadyFinished { .. }));
}

#[tokio::test]
async fn unknown_trace_is_an_error() {
    let tracer = make_tracer();
    let missing = TraceId::new();

    let err = tracer.complete_operation(missing, None, None).await.unwrap_err();
    assert!(matches!(err, TracerError::UnknownOperation(id) if id == missing));
    assert!(tracer.get_operation(missing).await.is_none());
    assert!(tracer.watch_status(missing).await.is_none());
}

#[tokio::test]
async fn fail_uses_default_error() {
    let tracer = make_tracer();
    let mut events = tracer.subscribe_events();
    let id = tracer.start_operation(op(OperationKind::CacheWrite, "k")).await;

    let trace = tracer.fail_operation(id, None).await.unwrap();
    assert_eq!(trace.status, OperationStatus::Failed);
    assert_eq!(trace.error.as_deref(), Some("operation failed"));
    assert!(!trace.timed_out);
    assert_eq!(
        drain_names(&mut events),
        vec!["operation_started", "operation_failed"]
    );
}

// ── Status watch & timeouts ──────────────────────────────────────

#[tokio::test]
async fn watch_sees_terminal_status() {
    let tracer = make_tracer();
    let id = tracer.start_operation(op(OperationKind::ApiFetch, "k")).await;
    let mut status = tracer.watch_status(id).await.unwrap();
    assert_eq!(*status.borrow(), OperationStatus::Pending);

    tracer.fail_operation(id, Some("upstream 503".into())).await.unwrap();
    status.changed().await.unwrap();
    assert_eq!(*status.borrow(), OperationStatus::Failed);

    let late = tracer.watch_status(id).await.unwrap();
    assert_eq!(*late.borrow(), OperationStatus::Failed);
}

#[tokio::test]
async fn overdue_operation_times_out() {
    let tracer = OperationTracer::new(TracerConfig {
        operation_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    let mut events = tracer.subscribe_events();
    let id = tracer.start_operation(op(OperationKind::ApiFetch, "slow")).await;
    let mut status = tracer.watch_status(id).await.unwrap();

    timeout(Duration::from_secs(2), status.wait_for(|s| s.is_terminal()))
        .await
        .unwrap()
        .unwrap();

    let trace = tracer.get_operation(id).await.unwrap();
    assert_eq!(trace.status, OperationStatus::Failed);
    assert!(trace.timed_out);
    assert!(trace.error.unwrap().contains("timed out"));
    let TracerEvent::OperationTimeout { trace } = expect_event(&mut events, "operation_timeout").await
    else {
        unreachable!()
    };
    assert_eq!(trace.id, id);
}

#[tokio::test]
async fn completing_before_timeout_disarms_it() {
    let tracer = OperationTracer::new(TracerConfig {
        operation_timeout: Duration::from_millis(40),
        ..Default::default()
    });
    let id = tracer.start_operation(op(OperationKind::CacheRead, "k")).await;
    tracer.complete_operation(id, None, None).await.unwrap();

    sleep(Duration::from_millis(100)).await;
    let trace = tracer.get_operation(id).await.unwrap();
    assert_eq!(trace.status, OperationStatus::Completed);
    assert!(!trace.timed_out);
}

// ── Concurrent api calls ─────────────────────────────────────────

#[tokio::test]
async fn concurrent_fetches_cancel_the_older_one() {
    let tracer = make_tracer();
    let mut events = tracer.subscribe_events();

    let op1 = tracer
        .start_operation(op(OperationKind::ApiFetch, "user:1").started_at(secs_ago(2)))
        .await;
    let op2 = tracer.start_operation(op(OperationKind::ApiFetch, "user:1")).await;

    let first = tracer.get_operation(op1).await.unwrap();
    assert_eq!(first.status, OperationStatus::Failed);
    assert!(first.error.unwrap().contains("cancel"));
    assert!(!first.timed_out);
    assert!(tracer.get_operation(op2).await.unwrap().is_pending());

    let races = tracer.get_detected_race_conditions().await;
    assert_eq!(races.len(), 1);
    let race = &races[0];
    assert_eq!(race.race_type, RaceType::ConcurrentUpdates);
    assert_eq!(race.resolution, RaceResolution::Auto);
    assert_eq!(race.rule_id, "concurrent_api_calls");
    assert_eq!(race.key, "user:1");
    assert_eq!(race.severity, Severity::Medium);
    let ids: Vec<TraceId> = race.operations.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![op1, op2]);

    assert_eq!(
        drain_names(&mut events),
        vec![
            "operation_started",
            "operation_started",
            "race_condition_detected",
            "operation_failed",
        ]
    );
}

#[tokio::test]
async fn fetches_on_different_keys_do_not_race() {
    let tracer = make_tracer();
    let a = tracer.start_operation(op(OperationKind::ApiFetch, "a")).await;
    let b = tracer.start_operation(op(OperationKind::ApiFetch, "b")).await;

    assert!(tracer.get_operation(a).await.unwrap().is_pending());
    assert!(tracer.get_operation(b).await.unwrap().is_pending());
    assert!(tracer.get_detected_race_conditions().await.is_empty());
}

#[tokio::test]
async fn sequential_fetches_do_not_race() {
    let tracer = make_tracer();
    let first = tracer.start_operation(op(OperationKind::ApiFetch, "k")).await;
    tracer.complete_operation(first, None, None).await.unwrap();
    let second = tracer.start_operation(op(OperationKind::ApiFetch, "k")).await;

    assert!(tracer.get_operation(second).await.unwrap().is_pending());
    assert!(tracer.get_detected_race_conditions().await.is_empty());
}

// ── Stale realtime override ──────────────────────────────────────

#[tokio::test]
async fn realtime_update_older_than_fresh_fetch_is_cancelled() {
    let tracer = make_tracer();
    let realtime = tracer
        .start_operation(op(OperationKind::RealtimeUpdate, "ticker").started_at(secs_ago(3)))
        .await;
    let fetch = tracer
        .start_operation(op(OperationKind::ApiFetch, "ticker").started_at(secs_ago(2)))
        .await;
    tracer.complete_operation(fetch, None, None).await.unwrap();
    assert!(tracer.get_operation(realtime).await.unwrap().is_pending());

    tracer.start_operation(op(OperationKind::CacheRead, "ticker")).await;

    let update = tracer.get_operation(realtime).await.unwrap();
    assert_eq!(update.status, OperationStatus::Failed);
    assert!(update.error.unwrap().contains("stale"));

    let races = tracer.get_detected_race_conditions().await;
    assert_eq!(races.len(), 1);
    assert_eq!(races[0].race_type, RaceType::StaleDataOverride);
    assert_eq!(races[0].severity, Severity::High);
    assert_eq!(races[0].resolution, RaceResolution::Auto);
}

// ── Flag-only rules ──────────────────────────────────────────────

#[tokio::test]
async fn every_rapid_firing_is_recorded() {
    let tracer = make_tracer();
    let mut events = tracer.subscribe_events();
    let poll = || op(OperationKind::Custom("poll".into()), "burst");

    for _ in 0..6 {
        tracer.start_operation(poll()).await;
    }
    let races = tracer.get_detected_race_conditions().await;
    assert_eq!(races.len(), 3);
    assert!(races.iter().all(|r| r.rule_id == "rapid_successive_operations"));
    assert!(races.iter().all(|r| r.resolution == RaceResolution::Manual));
    assert!(races.iter().all(|r| r.severity == Severity::Low));
    assert_eq!(races[2].operations.len(), 6);
    assert!(tracer.active_operations().await.iter().all(|t| t.is_pending()));

    let detected = drain_names(&mut events)
        .into_iter()
        .filter(|name| *name == "race_condition_detected")
        .count();
    assert_eq!(detected, 3);
}

#[tokio::test]
async fn repeat_flags_can_be_held_back_until_resolved() {
    let tracer = OperationTracer::new(TracerConfig {
        suppress_repeat_flags: true,
        ..Default::default()
    });
    let mut events = tracer.subscribe_events();
    let poll = || op(OperationKind::Custom("poll".into()), "burst");

    for _ in 0..5 {
        tracer.start_operation(poll()).await;
    }
    let races = tracer.get_detected_race_conditions().await;
    assert_eq!(races.len(), 1);

    let resolved = tracer
        .resolve_race_condition(races[0].id, RaceResolution::Ignored)
        .await
        .unwrap();
    assert_eq!(resolved.resolution, RaceResolution::Ignored);
    expect_event(&mut events, "race_condition_resolved").await;

    tracer.start_operation(poll()).await;
    assert_eq!(tracer.get_detected_race_conditions().await.len(), 2);
}

#[tokio::test]
async fn resolving_unknown_race_fails() {
    let tracer = make_tracer();
    let missing = RaceId::new();
    let err = tracer
        .resolve_race_condition(missing, RaceResolution::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, TracerError::UnknownRace(id) if id == missing));
}

#[tokio::test]
async fn tight_cache_loop_is_flagged() {
    let tracer = make_tracer();
    let base = secs_ago(10);
    for i in 0..5u64 {
        let kind = if i % 2 == 0 {
            OperationKind::CacheWrite
        } else {
            OperationKind::CacheRead
        };
        tracer
            .start_operation(op(kind, "cfg").started_at(base + Duration::from_millis(30 * i)))
            .await;
    }

    let races = tracer.get_detected_race_conditions().await;
    assert_eq!(races.len(), 1);
    assert_eq!(races[0].race_type, RaceType::CircularDependency);
    assert_eq!(races[0].resolution, RaceResolution::Manual);
}

// ── Rule management ──────────────────────────────────────────────

#[tokio::test]
async fn disabled_detection_runs_no_rules() {
    let tracer = make_tracer();
    let mut events = tracer.subscribe_events();

    tracer.set_detection_enabled(false);
    tracer.set_detection_enabled(false);
    assert!(!tracer.is_detection_enabled());
    let TracerEvent::DetectionStatusChanged { enabled } =
        expect_event(&mut events, "detection_status_changed").await
    else {
        unreachable!()
    };
    assert!(!enabled);
    assert!(drain_names(&mut events).is_empty());

    let a = tracer.start_operation(op(OperationKind::ApiFetch, "k")).await;
    let b = tracer.start_operation(op(OperationKind::ApiFetch, "k")).await;
    assert!(tracer.get_operation(a).await.unwrap().is_pending());
    assert!(tracer.get_operation(b).await.unwrap().is_pending());
    assert!(tracer.get_detected_race_conditions().await.is_empty());
}

#[tokio::test]
async fn disabled_rule_is_skipped() {
    let tracer = make_tracer();
    assert!(tracer.set_rule_enabled("concurrent_api_calls", false).await);
    assert!(!tracer.set_rule_enabled("no_such_rule", false).await);

    tracer.start_operation(op(OperationKind::ApiFetch, "k")).await;
    tracer.start_operation(op(OperationKind::ApiFetch, "k")).await;
    assert!(tracer.get_detected_race_conditions().await.is_empty());

    let rule = tracer
        .detection_rules()
        .await
        .into_iter()
        .find(|r| r.id == "concurrent_api_calls")
        .unwrap();
    assert!(!rule.enabled);
}

#[tokio::test]
async fn custom_rule_is_added_and_removed() {
    let tracer = make_tracer();
    let mut events = tracer.subscribe_events();

    let double_write = DetectionRule::new(
        "double_write",
        "Double cache write",
        RaceType::Deadlock,
        Severity::Critical,
        |ctx| ctx.pending(OperationKind::CacheWrite).count() >= 2,
    );
    assert!(!tracer.add_detection_rule(double_write).await);
    assert_eq!(drain_names(&mut events), vec!["rule_added"]);
    assert_eq!(tracer.detection_rules().await.last().unwrap().id, "double_write");

    tracer.start_operation(op(OperationKind::CacheWrite, "k")).await;
    tracer.start_operation(op(OperationKind::CacheWrite, "k")).await;
    let races = tracer.get_detected_race_conditions().await;
    assert_eq!(races.len(), 1);
    assert_eq!(races[0].rule_id, "double_write");
    assert_eq!(races[0].severity, Severity::Critical);

    assert!(tracer.remove_detection_rule("double_write").await);
    assert!(!tracer.remove_detection_rule("double_write").await);
    expect_event(&mut events, "rule_removed").await;
    assert_eq!(tracer.detection_rules().await.len(), 4);
}

// ── Stats & housekeeping ─────────────────────────────────────────

#[tokio::test]
async fn stats_cover_active_and_finished_traces() {
    let tracer = make_tracer();
    let a = tracer.start_operation(op(OperationKind::ApiFetch, "s1")).await;
    let b = tracer.start_operation(op(OperationKind::ApiFetch, "s2")).await;
    let c = tracer.start_operation(op(OperationKind::ApiFetch, "s3")).await;
    tracer.start_operation(op(OperationKind::ApiFetch, "s4")).await;

    tracer
        .complete_operation(a, Some(Duration::from_millis(100)), None)
        .await
        .unwrap();
    tracer
        .complete_operation(b, Some(Duration::from_millis(300)), None)
        .await
        .unwrap();
    tracer.fail_operation(c, None).await.unwrap();

    let stats = tracer.get_operation_stats().await;
    assert_eq!(stats.active, 1);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.avg_duration_ms, 200.0);
    assert_eq!(stats.race_conditions, 0);
}

#[tokio::test]
async fn cleanup_times_out_overdue_traces() {
    let tracer = make_tracer();
    let mut events = tracer.subscribe_events();
    let id = tracer
        .start_operation(op(OperationKind::ApiFetch, "k").started_at(secs_ago(60)))
        .await;

    let report = tracer.run_cleanup().await;
    assert_eq!(
        report,
        TraceSweepReport {
            trimmed_traces: 0,
            expired_races: 0,
            timed_out: 1,
        }
    );
    let trace = tracer.get_operation(id).await.unwrap();
    assert!(trace.timed_out);
    expect_event(&mut events, "operation_timeout").await;
    expect_event(&mut events, "cleanup_completed").await;
}

#[tokio::test]
async fn cleanup_drops_old_history_and_races() {
    let tracer = OperationTracer::new(TracerConfig {
        history_retention: Duration::from_millis(20),
        race_retention: Duration::from_millis(20),
        ..Default::default()
    });
    let older = tracer
        .start_operation(op(OperationKind::ApiFetch, "k").started_at(secs_ago(2)))
        .await;
    let newer = tracer.start_operation(op(OperationKind::ApiFetch, "k")).await;
    tracer.complete_operation(newer, None, None).await.unwrap();
    assert_eq!(tracer.get_detected_race_conditions().await.len(), 1);

    sleep(Duration::from_millis(60)).await;
    let report = tracer.run_cleanup().await;

    assert_eq!(report.trimmed_traces, 2);
    assert_eq!(report.expired_races, 1);
    assert_eq!(report.timed_out, 0);
    assert!(tracer.get_operation(older).await.is_none());
    assert!(tracer.get_detected_race_conditions().await.is_empty());
}

#[tokio::test]
async fn background_sweep_runs_until_stopped() {
    let tracer = OperationTracer::new(TracerConfig {
        sweep_interval: Duration::from_millis(20),
        history_retention: Duration::from_millis(10),
        ..Default::default()
    });
    tracer.start();
    tracer.start();
    assert!(tracer.is_running());

    let id = tracer.start_operation(op(OperationKind::CacheRead, "k")).await;
    tracer.complete_operation(id, None, None).await.unwrap();
    sleep(Duration::from_millis(150)).await;
    assert!(tracer.get_operation(id).await.is_none());

    tracer.stop();
    assert!(!tracer.is_running());
}
