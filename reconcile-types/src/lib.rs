//! Core type definitions for the reconciliation core.
//!
//! This crate defines the small, dependency-light types shared by the sync
//! manager and the operation tracer:
//! - Trace, race and version identifiers (UUID v7)
//! - Millisecond wall-clock timestamps
//! - Data sources (realtime push, API poll, cache read) and their priorities
//! - The [`Payload`] trait describing how values merge and append
//!
//! Nothing here performs I/O or owns shared state.

mod ids;
mod payload;
mod source;
mod timestamp;

pub use ids::{RaceId, TraceId, Version};
pub use payload::Payload;
pub use source::{DataSource, SourceKind};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A string that should hold an identifier is not a UUID.
    #[error("invalid {kind} {value:?}: {source}")]
    InvalidId {
        kind: &'static str,
        value: String,
        #[source]
        source: uuid::Error,
    },

    #[error("unknown source kind: {0}")]
    UnknownSourceKind(String),
}
