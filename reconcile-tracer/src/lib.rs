//! Operation tracing and race-condition detection.
//!
//! Producers that fetch, push or cache values for the same keys record each
//! unit of work as an [`OperationTrace`]. The [`OperationTracer`] evaluates
//! an ordered set of [`DetectionRule`]s whenever an operation starts, records
//! every firing as a [`RaceCondition`] and, for rules that auto-resolve,
//! cancels the operations that lost the race.
//!
//! # Default rules
//!
//! | Rule | Severity | Remediation |
//! |------|----------|-------------|
//! | `concurrent_api_calls` | medium | cancel all but the latest fetch |
//! | `stale_websocket_override` | high | cancel the stale realtime update |
//! | `rapid_successive_operations` | low | flag only |
//! | `circular_cache_dependency` | medium | flag only |
//!
//! # Example
//!
//! ```
//! use reconcile_tracer::{NewOperation, OperationKind, OperationTracer, TracerConfig};
//! use reconcile_types::Timestamp;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let tracer = OperationTracer::new(TracerConfig::default());
//! let earlier = Timestamp::now() - Duration::from_secs(2);
//! let first = tracer
//!     .start_operation(NewOperation::new(OperationKind::ApiFetch, "price").started_at(earlier))
//!     .await;
//! let second = tracer
//!     .start_operation(NewOperation::new(OperationKind::ApiFetch, "price"))
//!     .await;
//!
//! // The older fetch lost the race.
//! assert!(tracer.get_operation(first).await.unwrap().error.is_some());
//! assert!(tracer.get_operation(second).await.unwrap().is_pending());
//! # });
//! ```

pub mod default_rules;
mod error;
pub mod events;
pub mod race;
pub mod rules;
pub mod trace;
mod tracer;

pub use default_rules::default_rules;
pub use error::{TracerError, TracerResult};
pub use events::TracerEvent;
pub use race::{RaceCondition, RaceResolution, RaceType, Severity};
pub use rules::{DetectionRule, DetectionRuleEngine, Remediation, RuleCondition, RuleContext, RuleResolver};
pub use trace::{NewOperation, OperationKind, OperationStatus, OperationTrace};
pub use tracer::{OperationStats, OperationTracer, TraceSweepReport, TracerConfig};
