//! Race condition records.

use crate::trace::OperationTrace;
use reconcile_types::{RaceId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The pattern a rule detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceType {
    /// Overlapping writers or fetchers on the same key.
    ConcurrentUpdates,
    /// Older data about to overwrite newer data.
    StaleDataOverride,
    /// Operations feeding each other in a loop.
    CircularDependency,
    /// Operations waiting on each other.
    Deadlock,
}

impl fmt::Display for RaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConcurrentUpdates => "concurrent_updates",
            Self::StaleDataOverride => "stale_data_override",
            Self::CircularDependency => "circular_dependency",
            Self::Deadlock => "deadlock",
        })
    }
}

/// How bad a detected race is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// What happened to a detected race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceResolution {
    /// The rule's remediation ran when the race was detected.
    Auto,
    /// Waiting for (or settled by) an operator.
    Manual,
    /// Dismissed by an operator.
    Ignored,
}

/// A detected race. Only `resolution` changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceCondition {
    /// Unique record id.
    pub id: RaceId,
    /// The detected pattern.
    pub race_type: RaceType,
    /// Id of the rule that fired.
    pub rule_id: String,
    /// The key the traces concern.
    pub key: String,
    /// The traces the rule looked at, as they were when it fired.
    pub operations: Vec<OperationTrace>,
    /// When the rule fired.
    pub detected_at: Timestamp,
    /// Severity of the rule.
    pub severity: Severity,
    /// Current resolution.
    pub resolution: RaceResolution,
    /// Human-readable description of the rule.
    pub description: String,
}
