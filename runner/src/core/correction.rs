//! Deterministic correction policy: strategy selection, retry backoff and the
//! shape of a corrected step.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::classifier::FailureCategory;
use crate::core::types::{Step, StepStatus};

/// Marker that starts a correction directive appended to an action.
const DIRECTIVE_MARKER: &str = "\n[correction ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionStrategy {
    AlternativeSelector,
    AlternativeTool,
    GatherInformation,
    UpdatePlan,
    RetryWithDelay,
}

impl CorrectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            CorrectionStrategy::AlternativeSelector => "ALTERNATIVE_SELECTOR",
            CorrectionStrategy::AlternativeTool => "ALTERNATIVE_TOOL",
            CorrectionStrategy::GatherInformation => "GATHER_INFORMATION",
            CorrectionStrategy::UpdatePlan => "UPDATE_PLAN",
            CorrectionStrategy::RetryWithDelay => "RETRY_WITH_DELAY",
        }
    }
}

/// Map a failure category to its strategy.
///
/// Unclassified failures get another look at the page rather than a give-up.
pub fn select_strategy(category: FailureCategory) -> CorrectionStrategy {
    match category {
        FailureCategory::SelectorNotFound => CorrectionStrategy::AlternativeSelector,
        FailureCategory::ToolError => CorrectionStrategy::AlternativeTool,
        FailureCategory::AmbiguousState | FailureCategory::Unknown => {
            CorrectionStrategy::GatherInformation
        }
        FailureCategory::PlanInvalid => CorrectionStrategy::UpdatePlan,
        FailureCategory::Transient => CorrectionStrategy::RetryWithDelay,
    }
}

/// True once `attempt_number` is past the per-step bound.
pub fn exceeds_bound(attempt_number: u32, max_attempts: u32) -> bool {
    attempt_number > max_attempts
}

/// Exponential backoff for RETRY_WITH_DELAY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt_number` (1-indexed): `base * multiplier^(n-1)`, capped.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Why the correction engine stopped trying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveUpReason {
    Exhausted {
        attempt_number: u32,
        max_attempts: u32,
    },
    PlanInvalid(String),
}

/// Result of one correction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    /// Re-execute the same index with this step.
    Step {
        step: Step,
        strategy: CorrectionStrategy,
        reason: String,
        delay: Option<Duration>,
    },
    /// Replace the plan from the cursor onward (UPDATE_PLAN).
    Tail {
        steps: Vec<Step>,
        reason: String,
    },
    GiveUp(GiveUpReason),
}

/// Text appended to the action when no concrete revision is available.
pub fn directive_for(strategy: CorrectionStrategy) -> Option<&'static str> {
    match strategy {
        CorrectionStrategy::AlternativeSelector => {
            Some("the target element was not found; locate it with a different selector")
        }
        CorrectionStrategy::AlternativeTool => {
            Some("the previous tool failed; perform this with a different tool or interaction")
        }
        _ => None,
    }
}

/// Copy of `step` whose action carries `directive`, replacing any earlier one.
pub fn with_directive(step: &Step, attempt_number: u32, directive: &str) -> Step {
    let base = strip_directive(&step.action);
    Step {
        action: format!("{base}{DIRECTIVE_MARKER}{attempt_number}: {directive}]"),
        status: StepStatus::Corrected,
        ..step.clone()
    }
}

/// The action without any appended correction directive.
pub fn strip_directive(action: &str) -> &str {
    match action.find(DIRECTIVE_MARKER) {
        Some(pos) => &action[..pos],
        None => action,
    }
}
