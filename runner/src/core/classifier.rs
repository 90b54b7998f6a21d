//! Deterministic classification of verification failure reasons.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Failure category inferred from a verification `reason`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    SelectorNotFound,
    ToolError,
    AmbiguousState,
    PlanInvalid,
    Transient,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::SelectorNotFound => "selector_not_found",
            FailureCategory::ToolError => "tool_error",
            FailureCategory::AmbiguousState => "ambiguous_state",
            FailureCategory::PlanInvalid => "plan_invalid",
            FailureCategory::Transient => "transient",
            FailureCategory::Unknown => "unknown",
        }
    }
}

// Ordered: the first matching rule wins.
static RULES: LazyLock<Vec<(FailureCategory, Regex)>> = LazyLock::new(|| {
    [
        (
            FailureCategory::SelectorNotFound,
            r"(?i)\bnot found\b|no such element|could not (find|locate)|unable to (find|locate)|selector .*(missing|did not match)",
        ),
        (
            FailureCategory::ToolError,
            r"(?i)tool error|tool failure|action error|action failed|unsupported action|navigation failed",
        ),
        (
            FailureCategory::AmbiguousState,
            r"(?i)ambiguous|unclear|insufficient information|not enough information|cannot determine|unable to determine|inconclusive",
        ),
        (
            FailureCategory::PlanInvalid,
            r"(?i)plan (is )?(invalid|obsolete|no longer)|remaining plan|precondition|unexpected page|wrong page|out of order",
        ),
        (
            FailureCategory::Transient,
            r"(?i)timed out|timeout|network|connection (reset|refused|error)|temporar|transient|rate limit|\b50[234]\b",
        ),
    ]
    .into_iter()
    .map(|(category, pattern)| {
        let regex = Regex::new(pattern).expect("classifier pattern should be valid");
        (category, regex)
    })
    .collect()
});

/// Classify a failure reason into a [`FailureCategory`].
///
/// Rules are evaluated in table order; text that matches nothing is `Unknown`.
pub fn classify_reason(reason: &str) -> FailureCategory {
    RULES
        .iter()
        .find(|(_, regex)| regex.is_match(reason))
        .map(|(category, _)| *category)
        .unwrap_or(FailureCategory::Unknown)
}
