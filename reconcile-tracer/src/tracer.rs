//! Operation tracer, the race-condition detector service.
//!
//! Producers bracket each fetch, push or cache access with
//! [`start_operation`](OperationTracer::start_operation) and
//! [`complete_operation`](OperationTracer::complete_operation) /
//! [`fail_operation`](OperationTracer::fail_operation). Every start runs the
//! detection rules over the key's active and recently finished traces.
//!
//! Cancellation is cooperative: failing a trace does not interrupt the
//! producer. Producers that care watch their trace's status through
//! [`watch_status`](OperationTracer::watch_status) and abandon their work
//! once it turns terminal.

use crate::default_rules::default_rules;
use crate::error::{TracerError, TracerResult};
use crate::events::TracerEvent;
use crate::race::{RaceCondition, RaceResolution};
use crate::rules::{DetectionRule, DetectionRuleEngine, Remediation, RuleContext};
use crate::trace::{NewOperation, OperationStatus, OperationTrace};
use reconcile_types::{RaceId, Timestamp, TraceId};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Configuration for the operation tracer.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Pending traces older than this are force-failed.
    pub operation_timeout: Duration,
    /// How often housekeeping runs.
    pub sweep_interval: Duration,
    /// Finished traces are kept this long.
    pub history_retention: Duration,
    /// Race records are kept this long.
    pub race_retention: Duration,
    /// Finished traces younger than this are shown to the rules.
    pub recent_window: Duration,
    /// At most this many recent finished traces per key are shown to the rules.
    pub recent_limit: usize,
    /// Hard cap on finished traces kept.
    pub history_limit: usize,
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Whether rules run at all.
    pub detection_enabled: bool,
    /// Hold back repeat flag-only firings of a rule on a key while an earlier
    /// one is unresolved. Off by default: every firing is recorded.
    pub suppress_repeat_flags: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            history_retention: Duration::from_secs(300),
            race_retention: Duration::from_secs(300),
            recent_window: Duration::from_secs(60),
            recent_limit: 10,
            history_limit: 1_000,
            event_capacity: 256,
            detection_enabled: true,
            suppress_repeat_flags: false,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperationStats {
    /// Pending traces.
    pub active: usize,
    /// Completed traces still in history.
    pub completed: usize,
    /// Failed traces still in history, timeouts included.
    pub failed: usize,
    /// Mean duration of the completed traces in history.
    pub avg_duration_ms: f64,
    /// Race records on file.
    pub race_conditions: usize,
}

/// Result of one housekeeping pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceSweepReport {
    /// Finished traces dropped from history.
    pub trimmed_traces: usize,
    /// Race records dropped for age.
    pub expired_races: usize,
    /// Pending traces force-failed as overdue.
    pub timed_out: usize,
}

struct ActiveTrace {
    trace: OperationTrace,
    status: watch::Sender<OperationStatus>,
    timer: Option<JoinHandle<()>>,
}

struct TracerState {
    active: HashMap<TraceId, ActiveTrace>,
    history: VecDeque<OperationTrace>,
    races: Vec<RaceCondition>,
    /// Flag-only races nobody has settled yet.
    open_races: HashSet<RaceId>,
    rules: DetectionRuleEngine,
}

impl TracerState {
    fn take_active(&mut self, id: TraceId) -> TracerResult<ActiveTrace> {
        self.active.remove(&id).ok_or_else(|| {
            match self.history.iter().find(|t| t.id == id) {
                Some(done) => TracerError::AlreadyFinished {
                    id,
                    status: done.status,
                },
                None => TracerError::UnknownOperation(id),
            }
        })
    }

    /// Publishes the terminal status and moves the trace to history.
    fn archive(&mut self, active: ActiveTrace, history_limit: usize) -> OperationTrace {
        active.status.send_replace(active.trace.status);
        self.history.push_back(active.trace.clone());
        while self.history.len() > history_limit {
            self.history.pop_front();
        }
        active.trace
    }

    /// Fails a pending trace. Returns it with its timer, which the caller
    /// aborts unless it is running on that timer.
    fn fail(
        &mut self,
        id: TraceId,
        error: String,
        timed_out: bool,
        now: Timestamp,
        history_limit: usize,
    ) -> TracerResult<(OperationTrace, Option<JoinHandle<()>>)> {
        let mut active = self.take_active(id)?;
        active.trace.finish(OperationStatus::Failed, now, None);
        active.trace.error = Some(error);
        active.trace.timed_out = timed_out;
        let timer = active.timer.take();
        Ok((self.archive(active, history_limit), timer))
    }

    fn find(&self, id: TraceId) -> Option<&OperationTrace> {
        self.active
            .get(&id)
            .map(|a| &a.trace)
            .or_else(|| self.history.iter().find(|t| t.id == id))
    }

    /// Active traces plus the most recent finished ones for a key.
    fn context(&self, key: &str, now: Timestamp, config: &TracerConfig) -> RuleContext {
        let mut traces: Vec<OperationTrace> = self
            .active
            .values()
            .filter(|a| a.trace.key == key)
            .map(|a| a.trace.clone())
            .collect();
        traces.extend(
            self.history
                .iter()
                .rev()
                .filter(|t| {
                    t.key == key
                        && t.finished_at
                            .is_some_and(|at| now.since(at) <= config.recent_window)
                })
                .take(config.recent_limit)
                .cloned(),
        );
        traces.sort_by_key(|t| (t.timestamp, t.id));

        RuleContext {
            key: key.to_string(),
            now,
            traces,
        }
    }

    fn has_open_race(&self, rule_id: &str, key: &str) -> bool {
        self.races.iter().any(|r| {
            r.rule_id == rule_id && r.key == key && self.open_races.contains(&r.id)
        })
    }

    /// Runs the enabled rules for a key, applying auto-remediations.
    fn detect(&mut self, key: &str, now: Timestamp, config: &TracerConfig) -> Vec<TracerEvent> {
        let mut events = Vec::new();
        let rules: Vec<DetectionRule> = self.rules.enabled().cloned().collect();

        for rule in rules {
            if config.suppress_repeat_flags && self.has_open_race(&rule.id, key) {
                continue;
            }
            let ctx = self.context(key, now, config);
            if !rule.matches(&ctx) {
                continue;
            }

            let mut failed = Vec::new();
            let resolution = match rule.remediate(&ctx) {
                Some(remediations) => {
                    for remediation in remediations {
                        match remediation {
                            Remediation::Fail { id, error } => {
                                match self.fail(id, error, false, now, config.history_limit) {
                                    Ok((trace, timer)) => {
                                        if let Some(timer) = timer {
                                            timer.abort();
                                        }
                                        failed.push(trace);
                                    }
                                    Err(e) => debug!("Rule {} remediation skipped: {}", rule.id, e),
                                }
                            }
                        }
                    }
                    RaceResolution::Auto
                }
                None => RaceResolution::Manual,
            };

            let race = RaceCondition {
                id: RaceId::new(),
                race_type: rule.race_type,
                rule_id: rule.id.clone(),
                key: key.to_string(),
                operations: ctx.traces,
                detected_at: now,
                severity: rule.severity,
                resolution,
                description: rule.description.clone(),
            };
            warn!(
                "Race {} on key {}: rule {} ({} severity), {} traces cancelled",
                race.race_type,
                key,
                rule.id,
                race.severity,
                failed.len()
            );

            if race.resolution == RaceResolution::Manual {
                self.open_races.insert(race.id);
            }
            self.races.push(race.clone());
            events.push(TracerEvent::RaceConditionDetected { race });
            events.extend(
                failed
                    .into_iter()
                    .map(|trace| TracerEvent::OperationFailed { trace }),
            );
        }
        events
    }
}

/// The race-condition detector.
#[derive(Clone)]
pub struct OperationTracer {
    inner: Arc<Inner>,
}

struct Inner {
    config: TracerConfig,
    state: RwLock<TracerState>,
    events: broadcast::Sender<TracerEvent>,
    detection_enabled: AtomicBool,
    running: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl OperationTracer {
    /// Creates a tracer with the default rules.
    pub fn new(config: TracerConfig) -> Self {
        Self::with_rules(config, default_rules())
    }

    /// Creates a tracer with the given rules, in evaluation order.
    pub fn with_rules(config: TracerConfig, rules: Vec<DetectionRule>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = TracerState {
            active: HashMap::new(),
            history: VecDeque::new(),
            races: Vec::new(),
            open_races: HashSet::new(),
            rules: DetectionRuleEngine::with_rules(rules),
        };
        Self {
            inner: Arc::new(Inner {
                detection_enabled: AtomicBool::new(config.detection_enabled),
                config,
                state: RwLock::new(state),
                events,
                running: AtomicBool::new(false),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &TracerConfig {
        &self.inner.config
    }

    /// Subscribes to tracer events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TracerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: TracerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_all(&self, events: Vec<TracerEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn timeout_message(&self) -> String {
        format!(
            "timed out after {} ms",
            self.inner.config.operation_timeout.as_millis()
        )
    }

    // ── Operation lifecycle ──────────────────────────────────────

    /// Records a pending trace, arms its timeout and runs detection for its key.
    /// Must be called from within a tokio runtime.
    pub async fn start_operation(&self, op: NewOperation) -> TraceId {
        let trace = op.into_trace();
        let id = trace.id;
        let key = trace.key.clone();
        debug!("Started {} operation {} on key {}", trace.kind, id, key);

        let mut events = vec![TracerEvent::OperationStarted {
            trace: trace.clone(),
        }];
        {
            let mut state = self.inner.state.write().await;
            let (status, _) = watch::channel(OperationStatus::Pending);
            let timer = self.schedule_timeout(id);
            state.active.insert(
                id,
                ActiveTrace {
                    trace,
                    status,
                    timer: Some(timer),
                },
            );
            if self.is_detection_enabled() {
                events.extend(state.detect(&key, Timestamp::now(), &self.inner.config));
            }
        }

        self.emit_all(events);
        id
    }

    fn schedule_timeout(&self, id: TraceId) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.config.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                OperationTracer { inner }.time_out(id).await;
            }
        })
    }

    /// Runs on the trace's own timer, so the timer handle is dropped, not aborted.
    async fn time_out(&self, id: TraceId) -> bool {
        let result = self.inner.state.write().await.fail(
            id,
            self.timeout_message(),
            true,
            Timestamp::now(),
            self.inner.config.history_limit,
        );
        match result {
            Ok((trace, _timer)) => {
                warn!("Operation {} on key {} timed out", trace.id, trace.key);
                self.emit(TracerEvent::OperationTimeout { trace });
                true
            }
            Err(_) => false,
        }
    }

    /// Marks a trace completed. `duration` defaults to the time since it
    /// started; `metadata` is merged into the trace's metadata.
    pub async fn complete_operation(
        &self,
        id: TraceId,
        duration: Option<Duration>,
        metadata: Option<Map<String, Value>>,
    ) -> TracerResult<OperationTrace> {
        let (trace, timer) = {
            let mut state = self.inner.state.write().await;
            let mut active = state.take_active(id)?;
            active
                .trace
                .finish(OperationStatus::Completed, Timestamp::now(), duration);
            if let Some(extra) = metadata {
                active.trace.metadata.extend(extra);
            }
            let timer = active.timer.take();
            (state.archive(active, self.inner.config.history_limit), timer)
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        debug!(
            "Completed {} operation {} on key {} in {} ms",
            trace.kind,
            id,
            trace.key,
            trace.duration_ms.unwrap_or_default()
        );
        self.emit(TracerEvent::OperationCompleted {
            trace: trace.clone(),
        });
        Ok(trace)
    }

    /// Marks a trace failed.
    pub async fn fail_operation(
        &self,
        id: TraceId,
        error: Option<String>,
    ) -> TracerResult<OperationTrace> {
        let error = error.unwrap_or_else(|| "operation failed".to_string());
        let (trace, timer) = self.inner.state.write().await.fail(
            id,
            error,
            false,
            Timestamp::now(),
            self.inner.config.history_limit,
        )?;
        if let Some(timer) = timer {
            timer.abort();
        }

        debug!(
            "Failed {} operation {} on key {}: {}",
            trace.kind,
            id,
            trace.key,
            trace.error.as_deref().unwrap_or_default()
        );
        self.emit(TracerEvent::OperationFailed {
            trace: trace.clone(),
        });
        Ok(trace)
    }

    /// Watches a trace's status. The receiver sees the terminal status once
    /// the trace finishes, after which the sender is gone.
    pub async fn watch_status(&self, id: TraceId) -> Option<watch::Receiver<OperationStatus>> {
        let state = self.inner.state.read().await;
        if let Some(active) = state.active.get(&id) {
            return Some(active.status.subscribe());
        }
        state
            .history
            .iter()
            .find(|t| t.id == id)
            .map(|t| watch::channel(t.status).1)
    }

    /// Looks up a trace, active or finished.
    pub async fn get_operation(&self, id: TraceId) -> Option<OperationTrace> {
        self.inner.state.read().await.find(id).cloned()
    }

    /// Pending traces, oldest start first.
    pub async fn active_operations(&self) -> Vec<OperationTrace> {
        let mut active: Vec<_> = self
            .inner
            .state
            .read()
            .await
            .active
            .values()
            .map(|a| a.trace.clone())
            .collect();
        active.sort_by_key(|t| (t.timestamp, t.id));
        active
    }

    // ── Rules ────────────────────────────────────────────────────

    /// Adds a rule, replacing any rule with the same id. Returns whether one was replaced.
    pub async fn add_detection_rule(&self, rule: DetectionRule) -> bool {
        let rule_id = rule.id.clone();
        let replaced = self.inner.state.write().await.rules.add(rule);
        info!("Detection rule {} {}", rule_id, if replaced { "replaced" } else { "added" });
        self.emit(TracerEvent::RuleAdded { rule_id });
        replaced
    }

    /// Removes a rule. Returns whether it existed.
    pub async fn remove_detection_rule(&self, rule_id: &str) -> bool {
        let removed = self.inner.state.write().await.rules.remove(rule_id);
        if removed {
            info!("Detection rule {} removed", rule_id);
            self.emit(TracerEvent::RuleRemoved {
                rule_id: rule_id.to_string(),
            });
        }
        removed
    }

    /// Enables or disables one rule. Returns whether it exists.
    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let found = self
            .inner
            .state
            .write()
            .await
            .rules
            .set_enabled(rule_id, enabled);
        if found {
            debug!("Detection rule {} enabled: {}", rule_id, enabled);
        }
        found
    }

    /// Rules in evaluation order.
    pub async fn detection_rules(&self) -> Vec<DetectionRule> {
        self.inner.state.read().await.rules.iter().cloned().collect()
    }

    /// Turns rule evaluation on or off.
    pub fn set_detection_enabled(&self, enabled: bool) {
        let previous = self.inner.detection_enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!("Race detection {}", if enabled { "enabled" } else { "disabled" });
            self.emit(TracerEvent::DetectionStatusChanged { enabled });
        }
    }

    pub fn is_detection_enabled(&self) -> bool {
        self.inner.detection_enabled.load(Ordering::SeqCst)
    }

    // ── Races & stats ────────────────────────────────────────────

    /// Race records on file, oldest first.
    pub async fn get_detected_race_conditions(&self) -> Vec<RaceCondition> {
        self.inner.state.read().await.races.clone()
    }

    /// Records an operator's decision on a race.
    pub async fn resolve_race_condition(
        &self,
        id: RaceId,
        resolution: RaceResolution,
    ) -> TracerResult<RaceCondition> {
        let race = {
            let mut state = self.inner.state.write().await;
            let race = state
                .races
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(TracerError::UnknownRace(id))?;
            race.resolution = resolution;
            let race = race.clone();
            state.open_races.remove(&id);
            race
        };

        info!("Race {} on key {} marked {:?}", id, race.key, resolution);
        self.emit(TracerEvent::RaceConditionResolved { race: race.clone() });
        Ok(race)
    }

    pub async fn get_operation_stats(&self) -> OperationStats {
        let state = self.inner.state.read().await;
        let durations: Vec<u64> = state
            .history
            .iter()
            .filter(|t| t.status == OperationStatus::Completed)
            .filter_map(|t| t.duration_ms)
            .collect();
        let avg_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        OperationStats {
            active: state.active.len(),
            completed: durations.len(),
            failed: state
                .history
                .iter()
                .filter(|t| t.status == OperationStatus::Failed)
                .count(),
            avg_duration_ms,
            race_conditions: state.races.len(),
        }
    }

    // ── Housekeeping ─────────────────────────────────────────────

    /// Times out overdue traces and drops old history and race records.
    pub async fn run_cleanup(&self) -> TraceSweepReport {
        let now = Timestamp::now();
        let config = &self.inner.config;
        let mut timed_out = Vec::new();

        let report = {
            let mut state = self.inner.state.write().await;

            // Traces whose own timer never fired.
            let overdue: Vec<TraceId> = state
                .active
                .values()
                .filter(|a| now.since(a.trace.timestamp) > config.operation_timeout)
                .map(|a| a.trace.id)
                .collect();
            for id in overdue {
                if let Ok((trace, timer)) =
                    state.fail(id, self.timeout_message(), true, now, config.history_limit)
                {
                    if let Some(timer) = timer {
                        timer.abort();
                    }
                    timed_out.push(trace);
                }
            }

            let before = state.history.len();
            state.history.retain(|t| {
                t.finished_at
                    .is_none_or(|at| now.since(at) <= config.history_retention)
            });
            let trimmed_traces = before - state.history.len();

            let before = state.races.len();
            state
                .races
                .retain(|r| now.since(r.detected_at) <= config.race_retention);
            let expired_races = before - state.races.len();
            let TracerState {
                races, open_races, ..
            } = &mut *state;
            open_races.retain(|id| races.iter().any(|r| r.id == *id));

            TraceSweepReport {
                trimmed_traces,
                expired_races,
                timed_out: timed_out.len(),
            }
        };

        if report != TraceSweepReport::default() {
            info!(
                "Tracer sweep: {} traces trimmed, {} races expired, {} timed out",
                report.trimmed_traces, report.expired_races, report.timed_out
            );
        }
        for trace in timed_out {
            warn!("Operation {} on key {} timed out", trace.id, trace.key);
            self.emit(TracerEvent::OperationTimeout { trace });
        }
        self.emit(TracerEvent::CleanupCompleted {
            report: report.clone(),
        });
        report
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Spawns the housekeeping loop. Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let tracer = OperationTracer { inner };
                if !tracer.is_running() {
                    break;
                }
                tracer.run_cleanup().await;
            }
        });

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sweep);
        info!("Operation tracer started (sweep every {:?})", period);
    }

    /// Stops housekeeping. Per-operation timeouts stay armed.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
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
        info!("Operation tracer stopped");
    }
}
