//! Shared deterministic types for the execution loop.
//!
//! These types define stable contracts between the controller, the
//! verification and correction engines, and the collaborators. They do not
//! depend on external state or I/O.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a single plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Corrected,
}

impl StepStatus {
    /// Succeeded and Failed are final for the step within a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }

    /// Forward-only transitions. A corrected step is re-executed while it
    /// stays `Corrected`; it never moves back to `Running` or `Pending`.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        match (self, next) {
            (StepStatus::Pending, StepStatus::Running) => true,
            (StepStatus::Running | StepStatus::Corrected, StepStatus::Succeeded)
            | (StepStatus::Running | StepStatus::Corrected, StepStatus::Failed)
            | (StepStatus::Running | StepStatus::Corrected, StepStatus::Corrected) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Corrected => "corrected",
        }
    }
}

/// A structural check the verification engine can evaluate without judgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructuralCheck {
    ElementExists {
        selector: String,
    },
    ElementNotExists {
        selector: String,
    },
    ElementTextMatches {
        selector: String,
        pattern: String,
    },
    /// Passes when the observed URL differs from `from`.
    UrlChanged {
        #[serde(default)]
        from: Option<String>,
    },
}

impl StructuralCheck {
    /// True when the check names something concrete to evaluate. Checks
    /// without a target are skipped rather than counted as failures.
    pub fn has_target(&self) -> bool {
        match self {
            StructuralCheck::ElementExists { selector }
            | StructuralCheck::ElementNotExists { selector } => !selector.trim().is_empty(),
            StructuralCheck::ElementTextMatches { selector, pattern } => {
                !selector.trim().is_empty() && !pattern.is_empty()
            }
            StructuralCheck::UrlChanged { from } => from.as_deref().is_some_and(|u| !u.is_empty()),
        }
    }

    pub fn label(&self) -> String {
        match self {
            StructuralCheck::ElementExists { selector } => format!("element_exists({selector})"),
            StructuralCheck::ElementNotExists { selector } => {
                format!("element_not_exists({selector})")
            }
            StructuralCheck::ElementTextMatches { selector, pattern } => {
                format!("element_text_matches({selector}, /{pattern}/)")
            }
            StructuralCheck::UrlChanged { from } => {
                format!("url_changed(from={})", from.as_deref().unwrap_or(""))
            }
        }
    }
}

/// What a step is expected to achieve: an intent description for the
/// semantic judge plus optional structural checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedOutcome {
    pub description: String,
    #[serde(default)]
    pub checks: Vec<StructuralCheck>,
}

impl ExpectedOutcome {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            checks: Vec::new(),
        }
    }

    pub fn with_check(mut self, check: StructuralCheck) -> Self {
        self.checks.push(check);
        self
    }
}

/// One intended action plus its expected observable outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Stable position in the plan; never renumbered except by a tail splice.
    pub index: u32,
    pub description: String,
    pub action: String,
    pub expected_outcome: ExpectedOutcome,
    pub status: StepStatus,
}

/// Step content produced by a planner, before it is placed in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDraft {
    pub description: String,
    pub action: String,
    pub expected_outcome: ExpectedOutcome,
}

impl StepDraft {
    pub fn into_step(self, index: u32, status: StepStatus) -> Step {
        Step {
            index,
            description: self.description,
            action: self.action,
            expected_outcome: self.expected_outcome,
            status,
        }
    }
}

/// Ordered steps plus the execution cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub current_step_index: u32,
}

impl TaskPlan {
    /// Build a fresh plan from drafts: contiguous indices, all pending, cursor at 0.
    pub fn from_drafts(drafts: Vec<StepDraft>) -> Self {
        let steps = drafts
            .into_iter()
            .enumerate()
            .map(|(index, draft)| draft.into_step(index as u32, StepStatus::Pending))
            .collect();
        Self {
            steps,
            current_step_index: 0,
        }
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index as usize)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.current_step_index as usize)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_step_index as usize >= self.steps.len()
    }

    /// Steps from the cursor onward.
    pub fn remaining(&self) -> &[Step] {
        let start = (self.current_step_index as usize).min(self.steps.len());
        &self.steps[start..]
    }
}

/// Observed presence and text for a selector reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementState {
    pub present: bool,
    #[serde(default)]
    pub text: Option<String>,
}

/// Post-action observation returned by the step executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActualState {
    pub dom_snapshot: String,
    pub url: String,
    #[serde(default)]
    pub extracted_text: Option<String>,
    /// Keyed by selector.
    #[serde(default)]
    pub element_states: Option<BTreeMap<String, ElementState>>,
}

/// Controller state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Executing,
    Verifying,
    Advancing,
    Correcting,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Executing => "executing",
            RunState::Verifying => "verifying",
            RunState::Advancing => "advancing",
            RunState::Correcting => "correcting",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

/// Collaborators whose unavailability aborts a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collaborator {
    Executor,
    Judge,
    Planner,
    RecordStore,
}

impl Collaborator {
    pub fn as_str(self) -> &'static str {
        match self {
            Collaborator::Executor => "executor",
            Collaborator::Judge => "judge",
            Collaborator::Planner => "planner",
            Collaborator::RecordStore => "record_store",
        }
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    CorrectionExhausted {
        step_index: u32,
        attempt_number: u32,
        max_attempts: u32,
    },
    PlanInvalid {
        step_index: u32,
        message: String,
    },
    CollaboratorUnavailable {
        collaborator: Collaborator,
        message: String,
    },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::CorrectionExhausted {
                step_index,
                attempt_number,
                max_attempts,
            } => write!(
                f,
                "correction exhausted for step {step_index} (attempt {attempt_number} > max {max_attempts})"
            ),
            FailureReason::PlanInvalid {
                step_index,
                message,
            } => write!(f, "plan invalid at step {step_index}: {message}"),
            FailureReason::CollaboratorUnavailable {
                collaborator,
                message,
            } => write!(
                f,
                "collaborator unavailable ({}): {message}",
                collaborator.as_str()
            ),
        }
    }
}

/// Tenant/task/session identity for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub tenant_id: String,
    pub task_id: String,
    pub session_id: String,
}

impl RunContext {
    pub fn new(
        tenant_id: impl Into<String>,
        task_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            task_id: task_id.into(),
            session_id: session_id.into(),
        }
    }
}
