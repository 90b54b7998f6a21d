//! Self-correction engine.
//!
//! Turns a failed verification into the next thing to try: a corrected step
//! at the same index, a replacement plan tail, or a give-up once the attempt
//! bound is passed. The engine never persists; the controller records every
//! non-give-up result.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::core::classifier::classify_reason;
use crate::core::correction::{
    Correction, CorrectionStrategy, GiveUpReason, RetryPolicy, directive_for, exceeds_bound,
    select_strategy, with_directive,
};
use crate::core::plan::{index_tail, validate_tail};
use crate::core::types::{Step, StepStatus};
use crate::core::verification::VerificationResult;
use crate::io::planner::{Planner, PlannerError, RevisionRequest};

pub struct SelfCorrectionEngine {
    planner: Arc<dyn Planner>,
    max_attempts: u32,
    retry: RetryPolicy,
}

impl SelfCorrectionEngine {
    pub fn new(planner: Arc<dyn Planner>, max_attempts: u32, retry: RetryPolicy) -> Self {
        Self {
            planner,
            max_attempts,
            retry,
        }
    }

    /// Decide the correction for attempt `attempt_number` of `step_index`.
    ///
    /// `remaining` is the plan from the cursor onward, failed step first.
    /// Only planner unavailability is an error.
    #[instrument(skip_all, fields(step_index = step_index, attempt = attempt_number))]
    pub async fn correct(
        &self,
        step_index: u32,
        original: &Step,
        verification: &VerificationResult,
        attempt_number: u32,
        remaining: &[Step],
    ) -> Result<Correction, PlannerError> {
        if exceeds_bound(attempt_number, self.max_attempts) {
            info!(max_attempts = self.max_attempts, "correction bound reached");
            return Ok(Correction::GiveUp(GiveUpReason::Exhausted {
                attempt_number,
                max_attempts: self.max_attempts,
            }));
        }

        let category = classify_reason(&verification.reason);
        let strategy = select_strategy(category);
        let reason = format!("{}: {}", category.as_str(), verification.reason);
        debug!(
            category = category.as_str(),
            strategy = strategy.as_str(),
            "selected strategy"
        );

        let request = RevisionRequest {
            step_index,
            step: original.clone(),
            strategy,
            reason: verification.reason.clone(),
            attempt_number,
            remaining: remaining.to_vec(),
        };

        match strategy {
            CorrectionStrategy::AlternativeSelector | CorrectionStrategy::AlternativeTool => {
                let step = self.revised_step(&request).await?;
                Ok(Correction::Step {
                    step,
                    strategy,
                    reason,
                    delay: None,
                })
            }
            CorrectionStrategy::GatherInformation | CorrectionStrategy::RetryWithDelay => {
                let delay = (strategy == CorrectionStrategy::RetryWithDelay)
                    .then(|| self.retry.delay_for(attempt_number));
                Ok(Correction::Step {
                    step: Step {
                        status: StepStatus::Corrected,
                        ..original.clone()
                    },
                    strategy,
                    reason,
                    delay,
                })
            }
            CorrectionStrategy::UpdatePlan => {
                let Some(drafts) = self.planner.replan_tail(&request).await? else {
                    warn!("planner produced no replacement tail");
                    return Ok(Correction::GiveUp(GiveUpReason::PlanInvalid(
                        "planner produced no replacement tail".to_string(),
                    )));
                };
                let errors = validate_tail(&drafts);
                if !errors.is_empty() {
                    warn!(errors = ?errors, "replacement tail rejected");
                    return Ok(Correction::GiveUp(GiveUpReason::PlanInvalid(
                        errors.join("; "),
                    )));
                }
                Ok(Correction::Tail {
                    steps: index_tail(step_index, drafts),
                    reason,
                })
            }
        }
    }

    /// Planner revision when available, otherwise the original step with a
    /// directive for the executor.
    async fn revised_step(&self, request: &RevisionRequest) -> Result<Step, PlannerError> {
        if let Some(draft) = self.planner.revise_step(request).await? {
            if !draft.action.trim().is_empty() {
                return Ok(draft.into_step(request.step_index, StepStatus::Corrected));
            }
            warn!("planner revision has an empty action; falling back to directive");
        }
        let directive = directive_for(request.strategy).unwrap_or("try a different approach");
        Ok(with_directive(
            &request.step,
            request.attempt_number,
            directive,
        ))
    }
}
