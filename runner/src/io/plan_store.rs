//! Plan load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

use crate::core::plan::validate_plan;
use crate::core::types::TaskPlan;

const PLAN_SCHEMA: &str = include_str!("../../schemas/task_plan/v1.schema.json");

/// Load and validate a plan from disk (schema + invariants).
pub fn load_plan(path: &Path) -> Result<TaskPlan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    parse_plan(&contents).with_context(|| format!("load plan {}", path.display()))
}

/// Parse and validate a plan document.
pub fn parse_plan(contents: &str) -> Result<TaskPlan> {
    let value: Value = serde_json::from_str(contents).context("parse plan json")?;
    validate_schema(&value)?;
    let plan: TaskPlan = serde_json::from_value(value).context("deserialize plan")?;
    validate_plan_invariants(&plan)?;
    Ok(plan)
}

/// Atomically write a plan to disk (temp file + rename).
pub fn write_plan(path: &Path, plan: &TaskPlan) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("plan path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))
}

fn validate_schema(plan: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(PLAN_SCHEMA).context("parse plan schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn validate_plan_invariants(plan: &TaskPlan) -> Result<()> {
    let errors = validate_plan(plan);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("plan invariants failed: {}", errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{StepStatus, StructuralCheck};
    use crate::test_support::plan_of;

    /// Verifies write → load round-trip preserves the plan, checks included.
    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plans/checkout.json");
        let mut plan = plan_of(&["open cart", "pay"]);
        plan.steps[1].expected_outcome = plan.steps[1]
            .expected_outcome
            .clone()
            .with_check(StructuralCheck::ElementExists {
                selector: "#receipt".to_string(),
            })
            .with_check(StructuralCheck::UrlChanged {
                from: Some("https://shop.test/cart".to_string()),
            });

        write_plan(&path, &plan).expect("write");
        assert_eq!(load_plan(&path).expect("load"), plan);
    }

    #[test]
    fn cursor_defaults_to_zero() {
        let plan = parse_plan(
            r#"{"steps":[{"index":0,"description":"open","action":"goto /",
                "expected_outcome":{"description":"home page"},"status":"pending"}]}"#,
        )
        .expect("parse");
        assert_eq!(plan.current_step_index, 0);
        assert_eq!(plan.steps[0].status, StepStatus::Pending);
        assert!(plan.steps[0].expected_outcome.checks.is_empty());
    }

    #[test]
    fn empty_plan_fails_schema() {
        let err = parse_plan(r#"{"steps":[]}"#).expect_err("empty");
        assert!(err.to_string().contains("plan schema validation failed"));
    }

    #[test]
    fn unknown_check_type_fails_schema() {
        let err = parse_plan(
            r#"{"steps":[{"index":0,"description":"open","action":"goto /",
                "expected_outcome":{"description":"home","checks":[{"type":"screenshot_matches"}]},
                "status":"pending"}]}"#,
        )
        .expect_err("unknown check");
        assert!(err.to_string().contains("plan schema validation failed"));
    }

    #[test]
    fn gapped_indices_fail_invariants() {
        let err = parse_plan(
            r#"{"steps":[
                {"index":0,"description":"a","action":"do a","expected_outcome":{"description":"a"},"status":"pending"},
                {"index":2,"description":"b","action":"do b","expected_outcome":{"description":"b"},"status":"pending"}
            ]}"#,
        )
        .expect_err("gap");
        assert!(err.to_string().contains("plan invariants failed"));
        assert!(err.to_string().contains("contiguous from 0"));
    }
}
