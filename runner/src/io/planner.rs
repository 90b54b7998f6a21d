//! Planner revision capability used during self-correction.
//!
//! Plan generation itself happens outside this crate. The runner only asks a
//! planner for a revised step (alternative selector/tool) or for a new plan
//! tail (UPDATE_PLAN).

use async_trait::async_trait;
use thiserror::Error;

use crate::core::correction::CorrectionStrategy;
use crate::core::types::{Step, StepDraft};

/// Context handed to the planner for one correction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRequest {
    pub step_index: u32,
    pub step: Step,
    pub strategy: CorrectionStrategy,
    /// Verification reason that triggered the correction.
    pub reason: String,
    pub attempt_number: u32,
    /// Steps from the cursor onward, current step first.
    pub remaining: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("planner unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// A concrete replacement for the failed step, if the planner has one.
    async fn revise_step(
        &self,
        request: &RevisionRequest,
    ) -> Result<Option<StepDraft>, PlannerError>;

    /// A replacement for the remaining plan, if the planner can produce one.
    async fn replan_tail(
        &self,
        request: &RevisionRequest,
    ) -> Result<Option<Vec<StepDraft>>, PlannerError>;
}

/// Planner with no revision capability: steps are re-issued with a directive
/// and tail replacement is never available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPlanner;

#[async_trait]
impl Planner for NoopPlanner {
    async fn revise_step(
        &self,
        _request: &RevisionRequest,
    ) -> Result<Option<StepDraft>, PlannerError> {
        Ok(None)
    }

    async fn replan_tail(
        &self,
        _request: &RevisionRequest,
    ) -> Result<Option<Vec<StepDraft>>, PlannerError> {
        Ok(None)
    }
}
