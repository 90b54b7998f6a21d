//! Deterministic parts of step verification.
//!
//! Structural checks are evaluated here against the observation; the semantic
//! judge signal is supplied by the caller. The verdict policy is:
//!
//! 1. All evaluable structural checks pass: success, confidence 1.0.
//! 2. Otherwise the judge decides: match gives success at the semantic
//!    confidence, anything else is a failure with confidence 0.0.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::{ActualState, ExpectedOutcome, StructuralCheck};

pub const STRUCTURAL_CONFIDENCE: f64 = 1.0;
pub const DEFAULT_SEMANTIC_CONFIDENCE: f64 = 0.7;
pub const FAILURE_CONFIDENCE: f64 = 0.0;

/// Outcome of one structural check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomCheckResult {
    pub check: StructuralCheck,
    pub passed: bool,
    pub detail: String,
}

/// Signals that contributed to a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Absent when the expectation names no evaluable structural check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_checks: Option<Vec<DomCheckResult>>,
    /// Absent when the judge was not consulted or did not answer in time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_match: Option<bool>,
    pub overall_match: bool,
}

/// Verdict for one verification attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub confidence: f64,
    pub comparison: Comparison,
    pub reason: String,
}

/// What the semantic judge said, as seen by the verdict policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticSignal {
    Match { explanation: String },
    NoMatch { explanation: String },
    TimedOut { after: Duration },
}

impl VerificationResult {
    /// Failed verification for an attempt whose executor call did not produce
    /// an observation.
    pub fn execution_failed(label: &str, message: &str) -> Self {
        Self {
            success: false,
            confidence: FAILURE_CONFIDENCE,
            comparison: Comparison {
                dom_checks: None,
                semantic_match: None,
                overall_match: false,
            },
            reason: format!("execution failed [{label}]: {message}"),
        }
    }

    /// Failed verification for an attempt the semantic judge could not decide
    /// because it was unreachable. Structural results are kept.
    pub fn judge_unavailable(dom_checks: Option<Vec<DomCheckResult>>, message: &str) -> Self {
        Self {
            success: false,
            confidence: FAILURE_CONFIDENCE,
            comparison: Comparison {
                dom_checks,
                semantic_match: None,
                overall_match: false,
            },
            reason: format!("semantic judge unavailable: {message}"),
        }
    }
}

/// Evaluate every structural check that has a concrete target.
///
/// Returns `None` when no check is evaluable.
pub fn evaluate_checks(
    expected: &ExpectedOutcome,
    actual: &ActualState,
) -> Option<Vec<DomCheckResult>> {
    let results: Vec<DomCheckResult> = expected
        .checks
        .iter()
        .filter(|check| check.has_target())
        .map(|check| evaluate_check(check, actual))
        .collect();
    if results.is_empty() {
        None
    } else {
        Some(results)
    }
}

/// The cheap path: a verdict when every evaluated check passed.
pub fn structural_verdict(dom_checks: Option<&[DomCheckResult]>) -> Option<VerificationResult> {
    let checks = dom_checks?;
    if !checks.iter().all(|c| c.passed) {
        return None;
    }
    Some(VerificationResult {
        success: true,
        confidence: STRUCTURAL_CONFIDENCE,
        comparison: Comparison {
            dom_checks: Some(checks.to_vec()),
            semantic_match: None,
            overall_match: true,
        },
        reason: format!("dom checks passed ({}/{})", checks.len(), checks.len()),
    })
}

/// Combine structural results (absent or failing) with the judge signal.
pub fn conclude(
    dom_checks: Option<Vec<DomCheckResult>>,
    signal: SemanticSignal,
    semantic_confidence: f64,
) -> VerificationResult {
    let mut parts = Vec::new();
    match &dom_checks {
        None => parts.push("no structural checks".to_string()),
        Some(checks) => parts.push(summarize_checks(checks)),
    }

    let semantic_match = match &signal {
        SemanticSignal::Match { explanation } => {
            parts.push(format!("semantic judge: match ({})", explanation.trim()));
            Some(true)
        }
        SemanticSignal::NoMatch { explanation } => {
            parts.push(format!("semantic judge: no match ({})", explanation.trim()));
            Some(false)
        }
        SemanticSignal::TimedOut { after } => {
            parts.push(format!("semantic judge timed out after {}s", after.as_secs()));
            None
        }
    };

    let success = semantic_match == Some(true);
    let confidence = if success {
        semantic_confidence.clamp(0.0, 1.0)
    } else {
        FAILURE_CONFIDENCE
    };

    VerificationResult {
        success,
        confidence,
        comparison: Comparison {
            dom_checks,
            semantic_match,
            overall_match: success,
        },
        reason: parts.join("; "),
    }
}

fn summarize_checks(checks: &[DomCheckResult]) -> String {
    let passed = checks.iter().filter(|c| c.passed).count();
    let failures: Vec<&str> = checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.detail.as_str())
        .collect();
    format!(
        "dom checks {}/{} passed: {}",
        passed,
        checks.len(),
        failures.join(", ")
    )
}

fn evaluate_check(check: &StructuralCheck, actual: &ActualState) -> DomCheckResult {
    let label = check.label();
    let (passed, detail) = match check {
        StructuralCheck::ElementExists { selector } => {
            if look_up(actual, selector).present {
                (true, format!("{label} present"))
            } else {
                (false, format!("{label} not found"))
            }
        }
        StructuralCheck::ElementNotExists { selector } => {
            if look_up(actual, selector).present {
                (false, format!("{label} still present"))
            } else {
                (true, format!("{label} absent"))
            }
        }
        StructuralCheck::ElementTextMatches { selector, pattern } => {
            let found = look_up(actual, selector);
            if !found.present {
                (false, format!("{label} not found"))
            } else {
                match found.text.or_else(|| actual.extracted_text.clone()) {
                    None => (false, format!("{label} has no observed text")),
                    Some(text) if text_matches(pattern, &text) => {
                        (true, format!("{label} matched"))
                    }
                    Some(_) => (false, format!("{label} text did not match")),
                }
            }
        }
        StructuralCheck::UrlChanged { from } => {
            let from = from.as_deref().unwrap_or_default();
            if actual.url != from {
                (true, format!("{label} now {}", actual.url))
            } else {
                (false, format!("{label} url unchanged"))
            }
        }
    };
    DomCheckResult {
        check: check.clone(),
        passed,
        detail,
    }
}

struct Lookup {
    present: bool,
    text: Option<String>,
}

/// Executor-reported element state wins; otherwise fall back to scanning the
/// DOM snapshot.
fn look_up(actual: &ActualState, selector: &str) -> Lookup {
    if let Some(state) = actual
        .element_states
        .as_ref()
        .and_then(|states| states.get(selector))
    {
        return Lookup {
            present: state.present,
            text: state.text.clone(),
        };
    }
    Lookup {
        present: snapshot_contains(&actual.dom_snapshot, selector),
        text: None,
    }
}

fn snapshot_contains(dom: &str, selector: &str) -> bool {
    let selector = selector.trim();
    if let Some(id) = selector.strip_prefix('#') {
        let pattern = format!(r#"\bid\s*=\s*["']{}["']"#, regex::escape(id));
        return Regex::new(&pattern).is_ok_and(|re| re.is_match(dom));
    }
    if let Some(class) = selector.strip_prefix('.') {
        let pattern = format!(
            r#"\bclass\s*=\s*["']([^"']*\s)?{}(\s[^"']*)?["']"#,
            regex::escape(class)
        );
        return Regex::new(&pattern).is_ok_and(|re| re.is_match(dom));
    }
    if !selector.is_empty() && selector.chars().all(|c| c.is_ascii_alphanumeric()) {
        let pattern = format!(r"(?i)<{}[\s>/]", regex::escape(selector));
        return Regex::new(&pattern).is_ok_and(|re| re.is_match(dom));
    }
    dom.contains(selector)
}

/// Patterns are regular expressions; an invalid one is matched literally.
fn text_matches(pattern: &str, text: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(_) => text.contains(pattern),
    }
}
