//! Immutable audit records produced by a run.
//!
//! Every record is scoped by `(tenant_id, task_id)` and is written once. The
//! controller builds them; stores persist them verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::correction::CorrectionStrategy;
use crate::core::types::{
    ActualState, ExpectedOutcome, FailureReason, RunContext, RunState, Step,
};
use crate::core::verification::{Comparison, VerificationResult};

/// One verification attempt, including attempts after a correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub tenant_id: String,
    pub task_id: String,
    pub step_index: u32,
    pub success: bool,
    pub confidence: f64,
    pub expected_state: ExpectedOutcome,
    /// Absent when the executor call failed before producing an observation.
    pub actual_state: Option<ActualState>,
    pub comparison: Comparison,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl VerificationRecord {
    pub fn new(
        ctx: &RunContext,
        step: &Step,
        actual_state: Option<ActualState>,
        result: &VerificationResult,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id: ctx.tenant_id.clone(),
            task_id: ctx.task_id.clone(),
            step_index: step.index,
            success: result.success,
            confidence: result.confidence,
            expected_state: step.expected_outcome.clone(),
            actual_state,
            comparison: result.comparison.clone(),
            reason: result.reason.clone(),
            timestamp,
        }
    }
}

/// One correction attempt for a step index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub tenant_id: String,
    pub task_id: String,
    pub step_index: u32,
    pub original_step: Step,
    pub corrected_step: Step,
    pub strategy: CorrectionStrategy,
    pub reason: String,
    /// 1-based, contiguous per step index.
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// What the controller did with a step executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Completed,
    Errored,
    TimedOut,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Completed => "completed",
            ActionStatus::Errored => "errored",
            ActionStatus::TimedOut => "timed_out",
        }
    }
}

/// Append-only log of actions sent to the step executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAction {
    pub tenant_id: String,
    pub task_id: String,
    pub step_index: u32,
    pub action: String,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal record written when a run stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcomeRecord {
    pub tenant_id: String,
    pub task_id: String,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub current_step_index: u32,
    pub step_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Per-step record counts, used to derive the next attempt number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub verifications: u32,
    pub corrections: u32,
}

impl RecordCounts {
    pub fn next_attempt_number(self) -> u32 {
        self.corrections + 1
    }
}
