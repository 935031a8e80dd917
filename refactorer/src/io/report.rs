//! Run reports under `.refactorer/runs/<run-id>/report.json`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::core::merge::{FileStatus, file_statuses};
use crate::core::types::{PlanningRecord, RefactorFilesResult};
use crate::looping::{LoopStop, RunOutcome};
use crate::start::STATE_DIR;

/// Why the loop stopped, in report form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReport {
    Complete,
    Cycle { planned_files: Vec<String> },
    BudgetExhausted { spent_usd: f64 },
}

impl From<&LoopStop> for StopReport {
    fn from(stop: &LoopStop) -> Self {
        match stop {
            LoopStop::Complete => StopReport::Complete,
            LoopStop::Cycle { planned_files } => StopReport::Cycle {
                planned_files: planned_files.clone(),
            },
            LoopStop::BudgetExhausted { spent_usd } => StopReport::BudgetExhausted {
                spent_usd: *spent_usd,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport<'a> {
    pub run_id: &'a str,
    pub branch: &'a str,
    pub objective: &'a str,
    pub start_commit: &'a str,
    pub final_commit: &'a str,
    pub started_at: String,
    pub finished_at: String,
    pub iterations: u32,
    pub spent_usd: f64,
    /// Part of `spent_usd` that went to edits which produced content.
    pub edit_cost_usd: f64,
    pub stop: StopReport,
    pub file_status: BTreeMap<String, FileStatus>,
    pub planning: &'a [PlanningRecord],
    pub result: &'a RefactorFilesResult,
}

/// Identity and timing of a run, known before the loop starts.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: String,
    pub branch: String,
    pub objective: String,
    pub start_commit: String,
    pub started_at: DateTime<Utc>,
}

pub fn report_path(root: &Path, run_id: &str) -> PathBuf {
    root.join(STATE_DIR)
        .join("runs")
        .join(run_id)
        .join("report.json")
}

/// Write the final report for a run and return its path.
pub fn write_report(
    root: &Path,
    info: &RunInfo,
    outcome: &RunOutcome,
    spent_usd: f64,
) -> Result<PathBuf> {
    let report = RunReport {
        run_id: &info.run_id,
        branch: &info.branch,
        objective: &info.objective,
        start_commit: &info.start_commit,
        final_commit: &outcome.final_commit,
        started_at: timestamp(info.started_at),
        finished_at: timestamp(Utc::now()),
        iterations: outcome.iterations,
        spent_usd,
        edit_cost_usd: outcome.edit_cost_usd,
        stop: StopReport::from(&outcome.stop),
        file_status: file_statuses(&outcome.result),
        planning: &outcome.planning,
        result: &outcome.result,
    };

    let path = report_path(root, &info.run_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report dir {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(&report).context("serialize run report")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write report {}", path.display()))?;
    Ok(path)
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RefactorFailure, RefactorResult, RefactorStepResult, RefactorSuccess};

    #[test]
    fn report_contains_status_and_stop_reason() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut result = RefactorFilesResult::default();
        result.push_accepted(RefactorResult::Success(RefactorSuccess::new(
            "f1",
            Vec::new(),
            vec![RefactorStepResult {
                task: "t".to_string(),
                file_contents: "x".to_string(),
                commit: "c1".to_string(),
            }],
        )));
        result.push_discarded(RefactorFailure::new("f2", "lint failed: lint", Vec::new(), Vec::new()));
        let outcome = RunOutcome {
            result,
            planning: Vec::new(),
            stop: LoopStop::Cycle {
                planned_files: vec!["f2".to_string()],
            },
            final_commit: "c1".to_string(),
            iterations: 2,
            edit_cost_usd: 0.25,
        };
        let info = RunInfo {
            run_id: "run-abc".to_string(),
            branch: "refactor/run-abc".to_string(),
            objective: "tidy".to_string(),
            start_commit: "c0".to_string(),
            started_at: Utc::now(),
        };

        let path = write_report(temp.path(), &info, &outcome, 0.5).expect("write");
        assert_eq!(path, report_path(temp.path(), "run-abc"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(json["stop"]["reason"], "cycle");
        assert_eq!(json["file_status"]["f1"], "accepted");
        assert_eq!(json["file_status"]["f2"], "discarded");
        assert_eq!(json["result"]["accepted"]["f1"][0]["status"], "success");
        assert_eq!(json["final_commit"], "c1");
        assert_eq!(json["spent_usd"], 0.5);
        assert_eq!(json["edit_cost_usd"], 0.25);
    }
}
