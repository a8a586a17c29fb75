//! Error types for the tracer.

use crate::trace::OperationStatus;
use reconcile_types::{RaceId, TraceId};
use thiserror::Error;

/// Result type for tracer operations.
pub type TracerResult<T> = Result<T, TracerError>;

/// Errors that can occur in tracer operations.
#[derive(Debug, Error)]
pub enum TracerError {
    /// No trace with this id was ever started, or it was trimmed from history.
    #[error("unknown operation: {0}")]
    UnknownOperation(TraceId),

    /// The trace already reached a terminal status.
    #[error("operation {id} already {status}")]
    AlreadyFinished { id: TraceId, status: OperationStatus },

    /// No race condition with this id is on record.
    #[error("unknown race condition: {0}")]
    UnknownRace(RaceId),
}
