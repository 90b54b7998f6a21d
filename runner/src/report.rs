//! Downloadable renderings of a task's action history.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::SecondsFormat;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::records::TaskAction;

const MARKDOWN_TEMPLATE: &str = include_str!("templates/report.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Csv,
    Markdown,
}

impl ReportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Csv => "csv",
            ReportFormat::Markdown => "markdown",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "csv" => Ok(ReportFormat::Csv),
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            other => Err(anyhow!(
                "unknown report format '{other}' (expected json, csv or markdown)"
            )),
        }
    }
}

/// Flat row shared by every format.
#[derive(Debug, Clone, Serialize)]
struct ActionRow {
    step_index: u32,
    action: String,
    status: &'static str,
    thought: String,
    timestamp: String,
}

impl ActionRow {
    fn from_action(action: &TaskAction) -> Self {
        Self {
            step_index: action.step_index,
            action: action.action.clone(),
            status: action.status.as_str(),
            thought: action.thought.clone().unwrap_or_default(),
            timestamp: action.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    fn for_markdown(mut self) -> Self {
        self.action = markdown_cell(&self.action);
        self.thought = markdown_cell(&self.thought);
        self
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    task_id: &'a str,
    actions: &'a [TaskAction],
}

/// Render `actions` (in history order) for download.
pub fn render_actions(task_id: &str, actions: &[TaskAction], format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Json => {
            let mut buf = serde_json::to_string_pretty(&JsonReport { task_id, actions })
                .context("serialize json report")?;
            buf.push('\n');
            Ok(buf)
        }
        ReportFormat::Csv => render_csv(actions),
        ReportFormat::Markdown => render_markdown(task_id, actions),
    }
}

fn render_csv(actions: &[TaskAction]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for action in actions {
        writer
            .serialize(ActionRow::from_action(action))
            .context("write csv row")?;
    }
    if actions.is_empty() {
        writer
            .write_record(["step_index", "action", "status", "thought", "timestamp"])
            .context("write csv header")?;
    }
    let bytes = writer.into_inner().context("flush csv report")?;
    String::from_utf8(bytes).context("csv report is not utf-8")
}

fn render_markdown(task_id: &str, actions: &[TaskAction]) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("report", MARKDOWN_TEMPLATE)
        .context("load markdown report template")?;
    let rows: Vec<ActionRow> = actions
        .iter()
        .map(|action| ActionRow::from_action(action).for_markdown())
        .collect();
    let template = env.get_template("report")?;
    Ok(template.render(context! {
        task_id => task_id,
        actions => rows,
    })?)
}

fn markdown_cell(text: &str) -> String {
    text.trim()
        .replace('|', "\\|")
        .replace("\r\n", "<br>")
        .replace('\n', "<br>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::records::ActionStatus;
    use chrono::{TimeZone, Utc};

    fn actions() -> Vec<TaskAction> {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        vec![
            TaskAction {
                tenant_id: "tenant".to_string(),
                task_id: "task-1".to_string(),
                step_index: 0,
                action: "click #buy".to_string(),
                status: ActionStatus::Completed,
                thought: None,
                timestamp: at,
            },
            TaskAction {
                tenant_id: "tenant".to_string(),
                task_id: "task-1".to_string(),
                step_index: 1,
                action: "type a|b\n[correction 1: retry]".to_string(),
                status: ActionStatus::TimedOut,
                thought: Some("no response within 30s".to_string()),
                timestamp: at,
            },
        ]
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("JSON".parse::<ReportFormat>().expect("json"), ReportFormat::Json);
        assert_eq!("md".parse::<ReportFormat>().expect("md"), ReportFormat::Markdown);
        assert_eq!("csv".parse::<ReportFormat>().expect("csv"), ReportFormat::Csv);
        assert!("pdf".parse::<ReportFormat>().is_err());
    }

    #[test]
    fn csv_has_header_and_one_row_per_action() {
        let rendered = render_actions("task-1", &actions(), ReportFormat::Csv).expect("csv");
        let mut reader = csv::Reader::from_reader(rendered.as_bytes());
        let headers = reader.headers().expect("headers").clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec!["step_index", "action", "status", "thought", "timestamp"]
        );
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.expect("row")).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][1], "type a|b\n[correction 1: retry]");
        assert_eq!(&rows[1][2], "timed_out");
        assert_eq!(&rows[0][4], "2026-03-01T12:00:00.000Z");
    }

    #[test]
    fn json_keeps_records_in_order() {
        let rendered = render_actions("task-1", &actions(), ReportFormat::Json).expect("json");
        let value: serde_json::Value = serde_json::from_str(&rendered).expect("parse");
        assert_eq!(value["task_id"], "task-1");
        assert_eq!(value["actions"][0]["action"], "click #buy");
        assert_eq!(value["actions"][1]["status"], "timed_out");
    }

    #[test]
    fn markdown_renders_escaped_table() {
        let rendered =
            render_actions("task-1", &actions(), ReportFormat::Markdown).expect("markdown");
        assert!(rendered.starts_with("# Action history: task-1\n"));
        assert!(rendered.contains("| 1 | 0 | completed | click #buy |  |"));
        assert!(rendered.contains(
            "| 2 | 1 | timed_out | type a\\|b<br>[correction 1: retry] | no response within 30s |"
        ));
    }

    #[test]
    fn empty_history_still_renders() {
        let markdown = render_actions("task-1", &[], ReportFormat::Markdown).expect("markdown");
        assert!(markdown.contains("_No actions recorded._"));
        let csv = render_actions("task-1", &[], ReportFormat::Csv).expect("csv");
        assert_eq!(csv, "step_index,action,status,thought,timestamp\n");
    }
}
