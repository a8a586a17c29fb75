//! Data sources.
//!
//! Every update carries a [`DataSource`] describing where the value came
//! from, when it was observed and how much it should be trusted.

use crate::{Error, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The channel an update arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Push/real-time channel (websocket, server-sent events).
    Realtime,
    /// Periodic polling of an external API.
    Api,
    /// Read-through cache.
    Cache,
}

impl SourceKind {
    /// Default priority for this kind. Higher is more authoritative.
    #[must_use]
    pub const fn default_priority(&self) -> i32 {
        match self {
            Self::Realtime => 3,
            Self::Api => 2,
            Self::Cache => 1,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Api => "api",
            Self::Cache => "cache",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "realtime" => Ok(Self::Realtime),
            "api" => Ok(Self::Api),
            "cache" => Ok(Self::Cache),
            other => Err(Error::UnknownSourceKind(other.to_string())),
        }
    }
}

/// Where an update came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    /// The channel the update arrived through.
    pub kind: SourceKind,
    /// When the source observed the value.
    pub timestamp: Timestamp,
    /// Trust ranking; higher outranks lower under priority-based resolution.
    pub priority: i32,
    /// Upstream version of the value.
    pub version: Version,
}

impl DataSource {
    /// Creates a source of the given kind stamped now, with the kind's
    /// default priority and a freshly generated version.
    #[must_use]
    pub fn new(kind: SourceKind) -> Self {
        Self::at(kind, Timestamp::now())
    }

    /// Creates a source of the given kind with an explicit timestamp.
    #[must_use]
    pub fn at(kind: SourceKind, timestamp: Timestamp) -> Self {
        Self {
            kind,
            timestamp,
            priority: kind.default_priority(),
            version: Version::generate(),
        }
    }

    /// Overrides the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Overrides the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<Version>) -> Self {
        self.version = version.into();
        self
    }
}
