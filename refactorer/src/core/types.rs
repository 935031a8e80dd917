//! Shared deterministic types for refactor results.
//!
//! These types define stable contracts between the planner, the batch refactorer and
//! the result merger. They carry no I/O handles and serialize deterministically so they
//! can be fingerprinted, cached and written to run reports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A file selected by the planner for editing in one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    /// Repository-relative path.
    pub path: String,
    /// Why the planner selected this file.
    #[serde(default)]
    pub rationale: String,
}

impl PlannedFile {
    pub fn new(path: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            rationale: rationale.into(),
        }
    }
}

/// One attempted edit, recorded once the edit was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefactorStepResult {
    pub task: String,
    pub file_contents: String,
    pub commit: String,
}

/// A validation finding attributed to the commit that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Command line of the script that reported the issue.
    pub command: String,
    pub issue: String,
    pub file_path: String,
    pub commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefactorSuccess {
    pub file_path: String,
    pub issues: Vec<Issue>,
    pub steps: Vec<RefactorStepResult>,
    pub last_commit: Option<String>,
}

impl RefactorSuccess {
    /// `last_commit` is always derived from the final step.
    pub fn new(
        file_path: impl Into<String>,
        issues: Vec<Issue>,
        steps: Vec<RefactorStepResult>,
    ) -> Self {
        let last_commit = steps.last().map(|step| step.commit.clone());
        Self {
            file_path: file_path.into(),
            issues,
            steps,
            last_commit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefactorFailure {
    pub file_path: String,
    pub failure_description: String,
    pub issues: Vec<Issue>,
    pub steps: Vec<RefactorStepResult>,
    pub last_commit: Option<String>,
}

impl RefactorFailure {
    /// `last_commit` is always derived from the final step.
    pub fn new(
        file_path: impl Into<String>,
        failure_description: impl Into<String>,
        issues: Vec<Issue>,
        steps: Vec<RefactorStepResult>,
    ) -> Self {
        let last_commit = steps.last().map(|step| step.commit.clone());
        Self {
            file_path: file_path.into(),
            failure_description: failure_description.into(),
            issues,
            steps,
            last_commit,
        }
    }
}

/// Outcome of refactoring one file within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RefactorResult {
    Success(RefactorSuccess),
    Failure(RefactorFailure),
}

impl RefactorResult {
    pub fn file_path(&self) -> &str {
        match self {
            RefactorResult::Success(success) => &success.file_path,
            RefactorResult::Failure(failure) => &failure.file_path,
        }
    }

    pub fn last_commit(&self) -> Option<&str> {
        match self {
            RefactorResult::Success(success) => success.last_commit.as_deref(),
            RefactorResult::Failure(failure) => failure.last_commit.as_deref(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RefactorResult::Success(_))
    }
}

/// Per-file result histories for a batch or a whole run.
///
/// Both maps are append-only per key. A file can show up in both maps when different
/// batches produced different outcomes for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefactorFilesResult {
    pub accepted: BTreeMap<String, Vec<RefactorResult>>,
    pub discarded: BTreeMap<String, Vec<RefactorFailure>>,
}

impl RefactorFilesResult {
    pub fn push_accepted(&mut self, result: RefactorResult) {
        self.accepted
            .entry(result.file_path().to_string())
            .or_default()
            .push(result);
    }

    pub fn push_discarded(&mut self, failure: RefactorFailure) {
        self.discarded
            .entry(failure.file_path.clone())
            .or_default()
            .push(failure);
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.discarded.is_empty()
    }
}

/// Audit record of a single planning call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningRecord {
    pub planned_files: Vec<PlannedFile>,
    pub raw_response: String,
}
