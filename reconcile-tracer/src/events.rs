//! Events published by the operation tracer.

use crate::race::RaceCondition;
use crate::trace::OperationTrace;
use crate::tracer::TraceSweepReport;

/// Something observable happened in the tracer.
#[derive(Debug, Clone)]
pub enum TracerEvent {
    OperationStarted { trace: OperationTrace },
    OperationCompleted { trace: OperationTrace },
    OperationFailed { trace: OperationTrace },
    /// A trace was force-failed for exceeding the operation timeout.
    OperationTimeout { trace: OperationTrace },
    RaceConditionDetected { race: RaceCondition },
    RaceConditionResolved { race: RaceCondition },
    RuleAdded { rule_id: String },
    RuleRemoved { rule_id: String },
    DetectionStatusChanged { enabled: bool },
    CleanupCompleted { report: TraceSweepReport },
}

impl TracerEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OperationStarted { .. } => "operation_started",
            Self::OperationCompleted { .. } => "operation_completed",
            Self::OperationFailed { .. } => "operation_failed",
            Self::OperationTimeout { .. } => "operation_timeout",
            Self::RaceConditionDetected { .. } => "race_condition_detected",
            Self::RaceConditionResolved { .. } => "race_condition_resolved",
            Self::RuleAdded { .. } => "rule_added",
            Self::RuleRemoved { .. } => "rule_removed",
            Self::DetectionStatusChanged { .. } => "detection_status_changed",
            Self::CleanupCompleted { .. } => "cleanup_completed",
        }
    }
}
