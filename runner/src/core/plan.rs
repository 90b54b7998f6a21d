//! Plan invariants and tail splicing.

use crate::core::types::{Step, StepDraft, StepStatus, TaskPlan};

/// Check plan invariants not expressible via JSON Schema:
/// - At least one step
/// - Indices are contiguous from 0 in plan order
/// - Every step has a non-empty action
/// - `current_step_index <= len(steps)`
/// - Steps before the cursor have succeeded; steps after it are pending
///
/// Returns a list of stable error messages (empty on success).
pub fn validate_plan(plan: &TaskPlan) -> Vec<String> {
    let mut errors = Vec::new();
    if plan.steps.is_empty() {
        errors.push("plan has no steps".to_string());
        return errors;
    }

    for (position, step) in plan.steps.iter().enumerate() {
        if step.index as usize != position {
            errors.push(format!(
                "step at position {} has index {} (indices must be contiguous from 0)",
                position, step.index
            ));
        }
        if step.action.trim().is_empty() {
            errors.push(format!("step {}: action must be non-empty", step.index));
        }
    }

    let cursor = plan.current_step_index as usize;
    if cursor > plan.steps.len() {
        errors.push(format!(
            "current_step_index {} exceeds step count {}",
            cursor,
            plan.steps.len()
        ));
        return errors;
    }

    for step in &plan.steps[..cursor] {
        if step.status != StepStatus::Succeeded {
            errors.push(format!(
                "step {} precedes the cursor but is {}",
                step.index,
                step.status.as_str()
            ));
        }
    }
    for step in plan.steps.iter().skip(cursor + 1) {
        if step.status != StepStatus::Pending {
            errors.push(format!(
                "step {} follows the cursor but is {}",
                step.index,
                step.status.as_str()
            ));
        }
    }

    errors
}

/// Check that a replacement tail is usable: non-empty, every action non-empty.
pub fn validate_tail(tail: &[StepDraft]) -> Vec<String> {
    let mut errors = Vec::new();
    if tail.is_empty() {
        errors.push("replacement tail has no steps".to_string());
    }
    for (offset, draft) in tail.iter().enumerate() {
        if draft.action.trim().is_empty() {
            errors.push(format!(
                "replacement step {}: action must be non-empty",
                offset
            ));
        }
    }
    errors
}

/// Build the indexed steps for a tail starting at `start_index`.
///
/// The head replaces the step at the cursor and is marked `Corrected`; the
/// rest are `Pending`.
pub fn index_tail(start_index: u32, tail: Vec<StepDraft>) -> Vec<Step> {
    tail.into_iter()
        .enumerate()
        .map(|(offset, draft)| {
            let status = if offset == 0 {
                StepStatus::Corrected
            } else {
                StepStatus::Pending
            };
            draft.into_step(start_index + offset as u32, status)
        })
        .collect()
}

/// Replace everything from the cursor onward with `tail`, re-indexing
/// contiguously. The cursor and all steps before it are unchanged.
pub fn splice_tail(plan: &mut TaskPlan, tail: Vec<Step>) {
    let cursor = plan.current_step_index;
    plan.steps.truncate(cursor as usize);
    plan.steps
        .extend(tail.into_iter().enumerate().map(|(offset, mut step)| {
            step.index = cursor + offset as u32;
            step
        }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{draft, plan_of};

    #[test]
    fn fresh_plan_is_valid() {
        let plan = plan_of(&["open", "search", "buy"]);
        assert!(validate_plan(&plan).is_empty());
    }

    #[test]
    fn validate_plan_reports_errors() {
        let mut plan = plan_of(&["a", "b", "c"]);
        plan.steps[1].index = 5;
        plan.steps[2].action = " ".to_string();
        plan.current_step_index = 1;

        let errors = validate_plan(&plan);
        assert!(errors.iter().any(|e| e.contains("indices must be contiguous")));
        assert!(errors.iter().any(|e| e.contains("action must be non-empty")));
        assert!(errors.iter().any(|e| e.contains("precedes the cursor")));
    }

    #[test]
    fn empty_plan_is_invalid() {
        let plan = TaskPlan {
            steps: Vec::new(),
            current_step_index: 0,
        };
        assert_eq!(validate_plan(&plan), vec!["plan has no steps".to_string()]);
    }

    #[test]
    fn cursor_beyond_end_is_invalid() {
        let mut plan = plan_of(&["a"]);
        plan.steps[0].status = StepStatus::Succeeded;
        plan.current_step_index = 2;
        assert_eq!(
            validate_plan(&plan),
            vec!["current_step_index 2 exceeds step count 1".to_string()]
        );
    }

    /// Replacing steps [2,3,4] with [2',3'] keeps the cursor and renumbers contiguously.
    #[test]
    fn splice_replaces_tail_from_cursor() {
        let mut plan = plan_of(&["s0", "s1", "s2", "s3", "s4"]);
        plan.steps[0].status = StepStatus::Succeeded;
        plan.steps[1].status = StepStatus::Succeeded;
        plan.current_step_index = 2;

        let tail = index_tail(2, vec![draft("s2-prime"), draft("s3-prime")]);
        splice_tail(&mut plan, tail);

        assert_eq!(plan.current_step_index, 2);
        let summary: Vec<(u32, &str, StepStatus)> = plan
            .steps
            .iter()
            .map(|s| (s.index, s.description.as_str(), s.status))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, "s0", StepStatus::Succeeded),
                (1, "s1", StepStatus::Succeeded),
                (2, "s2-prime", StepStatus::Corrected),
                (3, "s3-prime", StepStatus::Pending),
            ]
        );
        assert!(validate_plan(&plan).is_empty());
    }

    #[test]
    fn validate_tail_rejects_empty_and_blank_actions() {
        assert_eq!(
            validate_tail(&[]),
            vec!["replacement tail has no steps".to_string()]
        );
        let mut blank = draft("x");
        blank.action = String::new();
        assert_eq!(
            validate_tail(&[draft("ok"), blank]),
            vec!["replacement step 1: action must be non-empty".to_string()]
        );
    }
}
