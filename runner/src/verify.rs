//! Verification engine: structural checks first, semantic judge as fallback.
//!
//! The verdict policy lives in [`crate::core::verification`]; this module adds
//! the judge call and its timeout. Nothing here persists anything.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::types::{ActualState, ExpectedOutcome};
use crate::core::verification::{
    DEFAULT_SEMANTIC_CONFIDENCE, SemanticSignal, VerificationResult, conclude, evaluate_checks,
    structural_verdict,
};
use crate::io::judge::{JudgeError, SemanticJudge};

pub struct VerificationEngine {
    judge: Arc<dyn SemanticJudge>,
    judge_timeout: Duration,
    semantic_confidence: f64,
}

impl VerificationEngine {
    pub fn new(judge: Arc<dyn SemanticJudge>, judge_timeout: Duration) -> Self {
        Self {
            judge,
            judge_timeout,
            semantic_confidence: DEFAULT_SEMANTIC_CONFIDENCE,
        }
    }

    /// Override the confidence reported for judge-only matches.
    pub fn with_semantic_confidence(mut self, confidence: f64) -> Self {
        self.semantic_confidence = confidence;
        self
    }

    /// Compare `actual` against `expected`.
    ///
    /// Returns `Err` only when the judge is unreachable; a judge that does not
    /// answer within the timeout yields a failed verdict instead.
    #[instrument(skip_all)]
    pub async fn verify(
        &self,
        expected: &ExpectedOutcome,
        actual: &ActualState,
    ) -> Result<VerificationResult, JudgeError> {
        let dom_checks = evaluate_checks(expected, actual);
        if let Some(result) = structural_verdict(dom_checks.as_deref()) {
            debug!(reason = %result.reason, "structural checks decided");
            return Ok(result);
        }

        let judged = tokio::time::timeout(
            self.judge_timeout,
            self.judge.judge(&expected.description, actual),
        )
        .await;
        let signal = match judged {
            Ok(Ok(judgment)) if judgment.is_match => SemanticSignal::Match {
                explanation: judgment.explanation,
            },
            Ok(Ok(judgment)) => SemanticSignal::NoMatch {
                explanation: judgment.explanation,
            },
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                warn!(timeout_secs = self.judge_timeout.as_secs(), "semantic judge timed out");
                SemanticSignal::TimedOut {
                    after: self.judge_timeout,
                }
            }
        };

        let result = conclude(dom_checks, signal, self.semantic_confidence);
        debug!(success = result.success, reason = %result.reason, "semantic judge decided");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ElementState, StructuralCheck};
    use crate::test_support::ScriptedJudge;
    use std::collections::BTreeMap;

    fn page(selector: &str, present: bool) -> ActualState {
        let mut states = BTreeMap::new();
        states.insert(
            selector.to_string(),
            ElementState {
                present,
                text: None,
            },
        );
        ActualState {
            dom_snapshot: "<html></html>".to_string(),
            url: "https://shop.test/cart".to_string(),
            extracted_text: None,
            element_states: Some(states),
        }
    }

    fn expects_receipt() -> ExpectedOutcome {
        ExpectedOutcome::described("receipt shown").with_check(StructuralCheck::ElementExists {
            selector: "#receipt".to_string(),
        })
    }

    /// All checks passing short-circuits the judge.
    #[tokio::test]
    async fn passing_checks_skip_judge() {
        let judge = Arc::new(ScriptedJudge::always(false));
        let engine = VerificationEngine::new(judge.clone(), Duration::from_secs(30));

        let result = engine
            .verify(&expects_receipt(), &page("#receipt", true))
            .await
            .expect("verify");

        assert!(result.success);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.comparison.semantic_match, None);
        assert_eq!(judge.calls(), 0);
    }

    #[tokio::test]
    async fn failing_checks_fall_back_to_judge() {
        let judge = Arc::new(ScriptedJudge::always(true));
        let engine = VerificationEngine::new(judge.clone(), Duration::from_secs(30));

        let result = engine
            .verify(&expects_receipt(), &page("#receipt", false))
            .await
            .expect("verify");

        assert!(result.success);
        assert_eq!(result.confidence, 0.7);
        assert_eq!(result.comparison.semantic_match, Some(true));
        assert!(result.comparison.overall_match);
        assert_eq!(
            result.comparison.dom_checks.as_ref().map(Vec::len),
            Some(1)
        );
        assert_eq!(judge.calls(), 1);
    }

    #[tokio::test]
    async fn no_checks_and_judge_rejects() {
        let judge = Arc::new(ScriptedJudge::always(false));
        let engine = VerificationEngine::new(judge, Duration::from_secs(30));

        let result = engine
            .verify(
                &ExpectedOutcome::described("logged in"),
                &ActualState::default(),
            )
            .await
            .expect("verify");

        assert!(!result.success);
        assert_eq!(result.confidence, 0.0);
        assert!(result.comparison.dom_checks.is_none());
        assert!(result.reason.starts_with("no structural checks; semantic judge: no match"));
    }

    #[tokio::test]
    async fn configured_confidence_is_used() {
        let judge = Arc::new(ScriptedJudge::always(true));
        let engine =
            VerificationEngine::new(judge, Duration::from_secs(30)).with_semantic_confidence(0.6);

        let result = engine
            .verify(
                &ExpectedOutcome::described("logged in"),
                &ActualState::default(),
            )
            .await
            .expect("verify");
        assert_eq!(result.confidence, 0.6);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_judge_times_out_as_failure() {
        let judge = Arc::new(ScriptedJudge::always(true).with_delay(Duration::from_secs(60)));
        let engine = VerificationEngine::new(judge, Duration::from_secs(5));

        let result = engine
            .verify(
                &ExpectedOutcome::described("logged in"),
                &ActualState::default(),
            )
            .await
            .expect("verify");

        assert!(!result.success);
        assert_eq!(result.comparison.semantic_match, None);
        assert!(result.reason.contains("semantic judge timed out after 5s"));
    }

    #[tokio::test]
    async fn unavailable_judge_is_an_error() {
        let judge = Arc::new(ScriptedJudge::unavailable("connection refused"));
        let engine = VerificationEngine::new(judge, Duration::from_secs(30));

        let err = engine
            .verify(
                &ExpectedOutcome::described("logged in"),
                &ActualState::default(),
            )
            .await
            .expect_err("unavailable");
        assert_eq!(err, JudgeError::Unavailable("connection refused".to_string()));
    }
}
