//! Operation traces.
//!
//! A trace brackets one externally meaningful unit of work (a fetch, a
//! realtime push, a cache access) against a key. Traces carry no data; they
//! only exist so overlapping work on the same key can be spotted.

use reconcile_types::{Timestamp, TraceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// What kind of work a trace covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A request to an external API.
    ApiFetch,
    /// A value pushed over a realtime channel.
    RealtimeUpdate,
    /// A cache lookup.
    CacheRead,
    /// A cache write.
    CacheWrite,
    /// Anything else, by name.
    Custom(String),
}

impl OperationKind {
    /// Stable name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ApiFetch => "api_fetch",
            Self::RealtimeUpdate => "realtime_update",
            Self::CacheRead => "cache_read",
            Self::CacheWrite => "cache_write",
            Self::Custom(name) => name,
        }
    }

    /// Whether this is a cache read or write.
    pub fn is_cache(&self) -> bool {
        matches!(self, Self::CacheRead | Self::CacheWrite)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

impl OperationStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded lifecycle of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationTrace {
    /// Unique trace id.
    pub id: TraceId,
    /// What kind of work this is.
    pub kind: OperationKind,
    /// The data key the work concerns.
    pub key: String,
    /// When the operation started.
    pub timestamp: Timestamp,
    /// Wall time the operation took, once finished.
    pub duration_ms: Option<u64>,
    /// Current status.
    pub status: OperationStatus,
    /// Free-form label of the producer.
    pub source: String,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
    /// Failure reason, if failed.
    pub error: Option<String>,
    /// Whether the failure was a forced timeout.
    pub timed_out: bool,
    /// When the operation reached its terminal status.
    pub finished_at: Option<Timestamp>,
}

impl OperationTrace {
    /// Whether the trace is still pending.
    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }

    /// Moves the trace to a terminal status.
    pub(crate) fn finish(
        &mut self,
        status: OperationStatus,
        now: Timestamp,
        duration: Option<Duration>,
    ) {
        let duration = duration.unwrap_or_else(|| now.since(self.timestamp));
        self.status = status;
        self.finished_at = Some(now);
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    }
}

/// Description of an operation about to start.
#[derive(Debug, Clone)]
pub struct NewOperation {
    /// What kind of work this is.
    pub kind: OperationKind,
    /// The data key the work concerns.
    pub key: String,
    /// Free-form label of the producer.
    pub source: String,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
    /// Start time; defaults to now.
    pub started_at: Option<Timestamp>,
}

impl NewOperation {
    /// Creates an operation of `kind` against `key`.
    pub fn new(kind: OperationKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            source: String::new(),
            metadata: Map::new(),
            started_at: None,
        }
    }

    /// Sets the producer label.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Backdates (or postdates) the start time.
    #[must_use]
    pub fn started_at(mut self, at: Timestamp) -> Self {
        self.started_at = Some(at);
        self
    }

    pub(crate) fn into_trace(self) -> OperationTrace {
        OperationTrace {
            id: TraceId::new(),
            kind: self.kind,
            key: self.key,
            timestamp: self.started_at.unwrap_or_else(Timestamp::now),
            duration_ms: None,
            status: OperationStatus::Pending,
            source: self.source,
            metadata: self.metadata,
            error: None,
            timed_out: false,
            finished_at: None,
        }
    }
}
