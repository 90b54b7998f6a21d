//! Step executor abstraction.
//!
//! The [`StepExecutor`] trait decouples run orchestration from the backend
//! that drives the live page. Tests use scripted executors that return
//! predetermined observations without touching a browser.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::ActualState;

/// Coarse classification reported with an executor failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    SelectorNotFound,
    Navigation,
    Tool,
    Timeout,
    Network,
    /// The executor itself is unreachable; not the task's fault.
    Unavailable,
}

impl ExecutionErrorKind {
    /// Phrase used in verification reasons; picked so the failure classifier
    /// maps it to the matching correction strategy.
    pub fn label(self) -> &'static str {
        match self {
            ExecutionErrorKind::SelectorNotFound => "element not found",
            ExecutionErrorKind::Navigation => "navigation failed",
            ExecutionErrorKind::Tool => "tool error",
            ExecutionErrorKind::Timeout => "timed out",
            ExecutionErrorKind::Network => "network error",
            ExecutionErrorKind::Unavailable => "executor unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", .kind.label())]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind == ExecutionErrorKind::Unavailable
    }
}

/// Performs one step action against the live target.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run `action` and return the post-action observation.
    async fn execute(&self, action: &str) -> Result<ActualState, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{FailureCategory, classify_reason};
    use crate::core::verification::VerificationResult;

    /// Reasons built from executor failures classify to the intended category.
    #[test]
    fn labels_classify_to_matching_categories() {
        let cases = [
            (
                ExecutionErrorKind::SelectorNotFound,
                FailureCategory::SelectorNotFound,
            ),
            (ExecutionErrorKind::Navigation, FailureCategory::ToolError),
            (ExecutionErrorKind::Tool, FailureCategory::ToolError),
            (ExecutionErrorKind::Timeout, FailureCategory::Transient),
            (ExecutionErrorKind::Network, FailureCategory::Transient),
        ];
        for (kind, expected) in cases {
            let result = VerificationResult::execution_failed(kind.label(), "details");
            assert_eq!(classify_reason(&result.reason), expected, "{kind:?}");
        }
    }

    #[test]
    fn error_display_includes_label() {
        let err = ExecutionError::new(ExecutionErrorKind::Tool, "click crashed");
        assert_eq!(err.to_string(), "tool error: click crashed");
        assert!(!err.is_unavailable());
    }
}
