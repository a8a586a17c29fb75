//! Simulated multi-source workload for the reconciliation core.
//!
//! Three producers share one [`SyncManager`] and one [`OperationTracer`]:
//!
//! 1. a realtime feed pushing small updates through the update queue,
//! 2. an API poller whose fetches overlap when latency exceeds the poll
//!    interval, so the tracer gets races to detect and cancel,
//! 3. a cache reader that falls back to hydrating keys from the cache.
//!
//! Every producer brackets its work with a trace and abandons it once the
//! tracer has cancelled that trace.

use anyhow::{Result, ensure};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reconcile_sync::{
    MemoryCache, PriorityBased, Subscription, SyncConfig, SyncManager, SyncStats, UpdateOperation,
};
use reconcile_tracer::{
    NewOperation, OperationKind, OperationStats, OperationTracer, RaceCondition, RaceResolution,
    RaceType, Severity, TracerConfig,
};
use reconcile_types::{SourceKind, TraceId};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{debug, info};

/// Subscriber id used to observe every simulated key.
pub const OBSERVER_ID: &str = "sim-observer";

/// Simulation settings.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// How long the producers run.
    pub duration: Duration,
    /// Keys the producers pick from.
    pub keys: Vec<String>,
    /// Period of the realtime feed.
    pub realtime_interval: Duration,
    /// Period of the API poller.
    pub api_interval: Duration,
    /// Upper bound of simulated fetch latency. Fetches take between half of
    /// this and all of it.
    pub api_latency: Duration,
    /// Period of the cache reader.
    pub cache_interval: Duration,
    /// Seed for the producers' random choices.
    pub seed: u64,
    pub sync: SyncConfig,
    pub tracer: TracerConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            keys: vec!["price:btc".into(), "price:eth".into(), "user:1".into()],
            realtime_interval: Duration::from_millis(50),
            api_interval: Duration::from_millis(150),
            api_latency: Duration::from_millis(400),
            cache_interval: Duration::from_millis(200),
            seed: 7,
            sync: SyncConfig {
                drain_interval: Duration::from_millis(50),
                ..Default::default()
            },
            tracer: TracerConfig::default(),
        }
    }
}

/// What the producers did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProducerCounts {
    pub realtime_updates: usize,
    pub realtime_cancelled: usize,
    pub api_fetches: usize,
    pub api_cancelled: usize,
    pub cache_hits: usize,
    pub cache_hydrations: usize,
    pub cache_misses: usize,
    /// Updates the manager refused.
    pub rejected: usize,
}

#[derive(Default)]
struct Counters {
    realtime_updates: AtomicUsize,
    realtime_cancelled: AtomicUsize,
    api_fetches: AtomicUsize,
    api_cancelled: AtomicUsize,
    cache_hits: AtomicUsize,
    cache_hydrations: AtomicUsize,
    cache_misses: AtomicUsize,
    rejected: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProducerCounts {
        let load = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        ProducerCounts {
            realtime_updates: load(&self.realtime_updates),
            realtime_cancelled: load(&self.realtime_cancelled),
            api_fetches: load(&self.api_fetches),
            api_cancelled: load(&self.api_cancelled),
            cache_hits: load(&self.cache_hits),
            cache_hydrations: load(&self.cache_hydrations),
            cache_misses: load(&self.cache_misses),
            rejected: load(&self.rejected),
        }
    }
}

/// One detected race, flattened for output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceSummary {
    pub rule_id: String,
    pub race_type: RaceType,
    pub key: String,
    pub severity: Severity,
    pub resolution: RaceResolution,
    pub operations: usize,
}

impl From<&RaceCondition> for RaceSummary {
    fn from(race: &RaceCondition) -> Self {
        Self {
            rule_id: race.rule_id.clone(),
            race_type: race.race_type,
            key: race.key.clone(),
            severity: race.severity,
            resolution: race.resolution,
            operations: race.operations.len(),
        }
    }
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub elapsed_ms: u64,
    pub producers: ProducerCounts,
    /// Commits delivered to the observer subscriptions.
    pub notifications: usize,
    /// Canonical value per key at the end of the run.
    pub values: Map<String, Value>,
    pub sync: SyncStats,
    pub tracer: OperationStats,
    pub races: Vec<RaceSummary>,
}

/// Shared handles for the producers.
#[derive(Clone)]
struct Harness {
    sync: SyncManager,
    tracer: OperationTracer,
    keys: Arc<[String]>,
    counters: Arc<Counters>,
    deadline: Instant,
}

impl Harness {
    fn pick_key(&self, rng: &mut StdRng) -> String {
        self.keys[rng.gen_range(0..self.keys.len())].clone()
    }

    async fn start(&self, kind: OperationKind, key: &str, source: &str) -> TraceId {
        self.tracer
            .start_operation(NewOperation::new(kind, key).with_source(source))
            .await
    }

    /// Whether the tracer has already settled the trace.
    async fn is_cancelled(&self, id: TraceId) -> bool {
        self.tracer
            .watch_status(id)
            .await
            .is_none_or(|status| status.borrow().is_terminal())
    }

    async fn finish(
        &self,
        id: TraceId,
        duration: Option<Duration>,
        metadata: Option<Map<String, Value>>,
    ) {
        if let Err(e) = self.tracer.complete_operation(id, duration, metadata).await {
            debug!("Trace {} settled before completion: {}", id, e);
        }
    }

    fn running(&self) -> bool {
        Instant::now() < self.deadline
    }
}

/// Runs the workload and reports what happened.
pub async fn run(config: SimConfig) -> Result<SimReport> {
    ensure!(!config.keys.is_empty(), "at least one key is required");
    ensure!(
        !config.realtime_interval.is_zero()
            && !config.api_interval.is_zero()
            && !config.cache_interval.is_zero(),
        "producer intervals must be non-zero"
    );

    let sync: SyncManager =
        SyncManager::with_cache(config.sync.clone(), Arc::new(MemoryCache::new()));
    let tracer = OperationTracer::new(config.tracer.clone());

    let mut subscriptions = Vec::with_capacity(config.keys.len());
    for key in &config.keys {
        sync.register_data_key(key.clone(), PriorityBased).await;
        subscriptions.push(sync.subscribe(key, OBSERVER_ID).await);
    }
    sync.start();
    tracer.start();

    info!(
        "Simulating {} keys for {:?} (seed {})",
        config.keys.len(),
        config.duration,
        config.seed
    );
    let started = Instant::now();
    let harness = Harness {
        sync: sync.clone(),
        tracer: tracer.clone(),
        keys: config.keys.clone().into(),
        counters: Arc::new(Counters::default()),
        deadline: started + config.duration,
    };

    tokio::join!(
        realtime_feed(harness.clone(), config.realtime_interval, config.seed),
        api_poller(
            harness.clone(),
            config.api_interval,
            config.api_latency,
            config.seed.wrapping_add(1)
        ),
        cache_reader(harness.clone(), config.cache_interval, config.seed.wrapping_add(2)),
    );

    sync.flush_queue().await;
    sync.stop();
    tracer.stop();

    let mut values = Map::new();
    for key in &config.keys {
        if let Some(current) = sync.get_data(key).await {
            values.insert(key.clone(), current.data);
        }
    }
    let report = SimReport {
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        producers: harness.counters.snapshot(),
        notifications: subscriptions.iter_mut().map(drain).sum(),
        values,
        sync: sync.get_stats().await,
        tracer: tracer.get_operation_stats().await,
        races: tracer
            .get_detected_race_conditions()
            .await
            .iter()
            .map(RaceSummary::from)
            .collect(),
    };
    info!(
        "Simulation finished: {} notifications, {} races",
        report.notifications,
        report.races.len()
    );
    Ok(report)
}

fn drain(subscription: &mut Subscription<Value>) -> usize {
    std::iter::from_fn(|| subscription.try_recv()).count()
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Pushes small realtime updates through the update queue.
async fn realtime_feed(harness: Harness, period: Duration, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ticker = ticker(period);
    let mut seq = 0u64;

    while harness.running() {
        ticker.tick().await;
        let key = harness.pick_key(&mut rng);
        let id = harness.start(OperationKind::RealtimeUpdate, &key, "realtime").await;
        if harness.is_cancelled(id).await {
            Counters::bump(&harness.counters.realtime_cancelled);
            continue;
        }

        seq += 1;
        let value = json!({ "value": rng.gen_range(0.0..100.0), "seq": seq });
        let source = harness.sync.create_data_source(SourceKind::Realtime, None);
        harness.sync.queue_update(
            UpdateOperation::new(key, value, source)
                .with_validator(|v: &Value| v.get("value").is_some_and(Value::is_number)),
        );
        Counters::bump(&harness.counters.realtime_updates);
        harness.finish(id, None, None).await;
    }
}

/// Polls every key; each fetch runs on its own task so slow fetches overlap.
async fn api_poller(harness: Harness, period: Duration, latency: Duration, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ticker = ticker(period);
    let max_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
    let mut fetches = Vec::new();

    while harness.running() {
        ticker.tick().await;
        for key in harness.keys.iter() {
            let delay = Duration::from_millis(rng.gen_range(max_ms / 2..=max_ms));
            let value = json!({ "value": rng.gen_range(0.0..100.0), "authoritative": true });
            fetches.push(tokio::spawn(fetch(harness.clone(), key.clone(), delay, value)));
        }
    }

    for result in futures::future::join_all(fetches).await {
        if let Err(e) = result {
            debug!("Fetch task ended abnormally: {}", e);
        }
    }
}

async fn fetch(harness: Harness, key: String, delay: Duration, value: Value) {
    let id = harness.start(OperationKind::ApiFetch, &key, "api").await;
    Counters::bump(&harness.counters.api_fetches);
    sleep(delay).await;

    if harness.is_cancelled(id).await {
        Counters::bump(&harness.counters.api_cancelled);
        return;
    }
    let source = harness.sync.create_data_source(SourceKind::Api, None);
    if let Err(e) = harness
        .sync
        .update_data(UpdateOperation::new(key.clone(), value, source))
        .await
    {
        debug!("Fetch for key {} rejected: {}", key, e);
        Counters::bump(&harness.counters.rejected);
    }

    let mut metadata = Map::new();
    metadata.insert("latency_ms".into(), json!(delay.as_millis() as u64));
    harness.finish(id, Some(delay), Some(metadata)).await;
}

/// Reads random keys, hydrating from the cache on a miss.
async fn cache_reader(harness: Harness, period: Duration, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ticker = ticker(period);

    while harness.running() {
        ticker.tick().await;
        let key = harness.pick_key(&mut rng);
        let id = harness.start(OperationKind::CacheRead, &key, "cache").await;

        if harness.sync.get_data(&key).await.is_some() {
            Counters::bump(&harness.counters.cache_hits);
        } else if harness.sync.hydrate_from_cache(&key).await.is_some() {
            Counters::bump(&harness.counters.cache_hydrations);
        } else {
            Counters::bump(&harness.counters.cache_misses);
        }
        harness.finish(id, None, None).await;
    }
}
