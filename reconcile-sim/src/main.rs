//! Reconciliation workload simulator
//!
//! Runs a realtime feed, an API poller and a cache reader against one sync
//! manager and one operation tracer, then prints a JSON report on stdout.
//!
//! Usage:
//!   reconcile-sim --duration 10 --keys price:btc,price:eth --pretty
//!
//! `RUST_LOG` directives take precedence over `--verbose`.

use anyhow::{Context, Result};
use clap::Parser;
use reconcile_sim::{SimConfig, run};
use reconcile_sync::SyncConfig;
use reconcile_tracer::TracerConfig;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "reconcile-sim")]
#[command(about = "Drive a simulated multi-source workload through the reconciliation core")]
struct Args {
    /// How long the producers run, in seconds
    #[arg(short, long, default_value = "5")]
    duration: u64,

    /// Comma-separated keys the producers update
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "price:btc,price:eth,user:1"
    )]
    keys: Vec<String>,

    /// Realtime feed period in milliseconds
    #[arg(long, default_value = "50")]
    realtime_ms: u64,

    /// API poll period in milliseconds
    #[arg(long, default_value = "150")]
    api_ms: u64,

    /// Maximum simulated API latency in milliseconds
    #[arg(long, default_value = "400")]
    api_latency_ms: u64,

    /// Cache read period in milliseconds
    #[arg(long, default_value = "200")]
    cache_ms: u64,

    /// Seconds after which a value counts as stale
    #[arg(long, default_value = "30")]
    stale_after: u64,

    /// Pending operations older than this many seconds are timed out
    #[arg(long, default_value = "30")]
    operation_timeout: u64,

    /// Seed for the producers' random choices
    #[arg(long, default_value = "7")]
    seed: u64,

    /// Pretty-print the report
    #[arg(long)]
    pretty: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn sim_config(&self) -> SimConfig {
        let defaults = SimConfig::default();
        SimConfig {
            duration: Duration::from_secs(self.duration),
            keys: self.keys.clone(),
            realtime_interval: Duration::from_millis(self.realtime_ms),
            api_interval: Duration::from_millis(self.api_ms),
            api_latency: Duration::from_millis(self.api_latency_ms),
            cache_interval: Duration::from_millis(self.cache_ms),
            seed: self.seed,
            sync: SyncConfig {
                staleness_threshold: Duration::from_secs(self.stale_after),
                ..defaults.sync
            },
            tracer: TracerConfig {
                operation_timeout: Duration::from_secs(self.operation_timeout),
                ..defaults.tracer
            },
        }
    }
}

/// Log filter from `RUST_LOG`, falling back to info or, with `verbose`, debug.
fn log_filter(verbose: bool, rust_log: Option<&str>) -> EnvFilter {
    let level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(rust_log.unwrap_or_default())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    FmtSubscriber::builder()
        .with_env_filter(log_filter(args.verbose, rust_log.as_deref()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    info!("Reconciliation simulator starting...");
    let report = run(args.sim_config()).await.context("Simulation failed")?;

    let json = if args.pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    }
    .context("Failed to encode report")?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_selects_the_default_level() {
        assert_eq!(log_filter(false, None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(log_filter(true, None).max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn rust_log_directives_are_applied() {
        let filter = log_filter(false, Some("reconcile_sync=trace"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }
}
