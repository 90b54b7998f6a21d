//! Progress events published to session observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{FailureReason, RunState, TaskPlan};

/// Event payloads, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PlanPreview {
        plan: TaskPlan,
    },
    PlanUpdate {
        plan: TaskPlan,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    StepResult {
        step_index: u32,
        success: bool,
        confidence: f64,
    },
    RunFinished {
        state: RunState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<FailureReason>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PlanPreview { .. } => "plan_preview",
            EventKind::PlanUpdate { .. } => "plan_update",
            EventKind::StepResult { .. } => "step_result",
            EventKind::RunFinished { .. } => "run_finished",
        }
    }
}

/// One ordered notification for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    /// Strictly increasing per task, across runs. The high 32 bits carry the
    /// run's lease generation and the low 32 bits count events within the run.
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Assigns sequence numbers for one run.
#[derive(Debug, Default)]
pub struct EventSequencer {
    generation: u64,
    last: u32,
}

impl EventSequencer {
    /// Sequencer for the run holding lease `generation`. Later generations
    /// always number above earlier ones.
    pub fn for_generation(generation: u64) -> Self {
        Self {
            generation,
            last: 0,
        }
    }

    pub fn next_event(
        &mut self,
        task_id: &str,
        kind: EventKind,
        timestamp: DateTime<Utc>,
    ) -> ProgressEvent {
        self.last = self.last.saturating_add(1);
        ProgressEvent {
            task_id: task_id.to_string(),
            sequence_number: (self.generation << 32) | u64::from(self.last),
            timestamp,
            kind,
        }
    }
}
