//! Test-only collaborators: scripted model steps, a scripted validator, an in-memory
//! VCS and a throwaway git repository.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{Issue, PlannedFile};
use crate::io::editor::{EditOutput, EditRequest};
use crate::io::git::{Vcs, resolve_in_repo};
use crate::io::model::UnprocessableOutputError;
use crate::io::validation::{ScriptSpec, ValidationRunner};
use crate::memo::{Step, StepContext, StepFuture};
use crate::plan::{PlanRequest, PlanResponse};

/// Planning step that answers from a script, one entry per live call.
///
/// Calls beyond the script return an empty plan.
pub struct ScriptedPlanStep {
    plans: Mutex<VecDeque<Vec<String>>>,
    error: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedPlanStep {
    pub fn new(plans: Vec<Vec<&str>>) -> Self {
        Self {
            plans: Mutex::new(
                plans
                    .into_iter()
                    .map(|paths| paths.into_iter().map(str::to_string).collect())
                    .collect(),
            ),
            error: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// A planner whose every call fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Number of live (uncached) calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Step for ScriptedPlanStep {
    type Input = PlanRequest;
    type Output = PlanResponse;

    fn name(&self) -> &str {
        "plan"
    }

    fn run<'a>(
        &'a self,
        _input: &'a PlanRequest,
        _ctx: &'a StepContext,
    ) -> StepFuture<'a, PlanResponse> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.error {
                return Err(anyhow!("{message}"));
            }
            let paths = self
                .plans
                .lock()
                .map_err(|_| anyhow!("scripted plans poisoned"))?
                .pop_front()
                .unwrap_or_default();
            let planned_files = paths
                .iter()
                .map(|path| PlannedFile::new(path.as_str(), format!("refactor {path}")))
                .collect();
            Ok(PlanResponse {
                planned_files,
                raw_response: serde_json::to_string(&paths)?,
            })
        })
    }
}

/// Price reported by every scripted edit that produced content.
pub const EDIT_COST_USD: f64 = 0.25;

/// One scripted editor answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditReply {
    Content(String),
    /// Fails with [`UnprocessableOutputError`] (retryable).
    Unprocessable,
    /// Fails with a plain error (aborts the run).
    Broken,
}

impl EditReply {
    pub fn content(content: &str) -> Self {
        EditReply::Content(content.to_string())
    }
}

/// Edit step answering from per-path queues and recording every live request.
#[derive(Default)]
pub struct ScriptedEditStep {
    replies: Mutex<BTreeMap<String, VecDeque<EditReply>>>,
    requests: Mutex<Vec<EditRequest>>,
}

impl ScriptedEditStep {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next answer for `path`.
    pub fn reply(&self, path: &str, reply: EditReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.entry(path.to_string()).or_default().push_back(reply);
        }
    }

    pub fn requests(&self) -> Vec<EditRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn answer(&self, input: &EditRequest) -> Result<EditOutput> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("scripted requests poisoned"))?
            .push(input.clone());
        let reply = self
            .replies
            .lock()
            .map_err(|_| anyhow!("scripted replies poisoned"))?
            .get_mut(&input.file_path)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow!("no scripted edit for {}", input.file_path))?;
        match reply {
            EditReply::Content(content) => Ok(EditOutput {
                content,
                cost_usd: EDIT_COST_USD,
            }),
            EditReply::Unprocessable => {
                Err(UnprocessableOutputError::new(&input.model, "scripted unusable output").into())
            }
            EditReply::Broken => Err(anyhow!("scripted editor failure")),
        }
    }
}

impl Step for ScriptedEditStep {
    type Input = EditRequest;
    type Output = EditOutput;

    fn name(&self) -> &str {
        "edit"
    }

    fn run<'a>(&'a self, input: &'a EditRequest, _ctx: &'a StepContext) -> StepFuture<'a, EditOutput> {
        Box::pin(async move { self.answer(input) })
    }
}

/// Validator that reports configured issues and counts runs per command.
#[derive(Default)]
pub struct ScriptedValidator {
    failures: Mutex<Vec<(String, String, String)>>,
    runs: Mutex<BTreeMap<String, usize>>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run of `command` that covers `path` reports `message`.
    pub fn fail(&self, command: &str, path: &str, message: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push((command.to_string(), path.to_string(), message.to_string()));
        }
    }

    pub fn runs_of(&self, command: &str) -> usize {
        self.runs
            .lock()
            .map(|runs| runs.get(command).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn check(&self, spec: &ScriptSpec, changed_files: &[String], commit: &str) -> Result<Vec<Issue>> {
        let command = spec.command_line();
        *self
            .runs
            .lock()
            .map_err(|_| anyhow!("scripted runs poisoned"))?
            .entry(command.clone())
            .or_default() += 1;
        let failures = self
            .failures
            .lock()
            .map_err(|_| anyhow!("scripted failures poisoned"))?;
        Ok(failures
            .iter()
            .filter(|(cmd, path, _)| *cmd == command && changed_files.contains(path))
            .map(|(_, path, message)| Issue {
                command: command.clone(),
                issue: message.clone(),
                file_path: path.clone(),
                commit: commit.to_string(),
                code: None,
            })
            .collect())
    }
}

impl ValidationRunner for ScriptedValidator {
    fn run<'a>(
        &'a self,
        spec: &'a ScriptSpec,
        changed_files: &'a [String],
        commit: &'a str,
    ) -> StepFuture<'a, Vec<Issue>> {
        Box::pin(async move { self.check(spec, changed_files, commit) })
    }
}

#[derive(Debug, Clone)]
struct FakeCommit {
    id: String,
    parent: Option<String>,
    files: BTreeMap<String, String>,
}

#[derive(Debug)]
struct FakeHistory {
    commits: Vec<FakeCommit>,
    head: String,
}

/// In-memory [`Vcs`] with commit ids `c0`, `c1`, ...
///
/// Committing the same change on the same parent reuses the existing id, so a replayed
/// run lands on the same commits as the original one.
pub struct FakeVcs {
    history: Mutex<FakeHistory>,
}

impl FakeVcs {
    /// Start with one commit `c0` holding `files`.
    pub fn new(files: &[(&str, &str)]) -> Self {
        let files = files
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect();
        Self {
            history: Mutex::new(FakeHistory {
                commits: vec![FakeCommit {
                    id: "c0".to_string(),
                    parent: None,
                    files,
                }],
                head: "c0".to_string(),
            }),
        }
    }

    pub fn head(&self) -> String {
        self.with_history(|history| Ok(history.head.clone()))
            .unwrap_or_default()
    }

    /// File contents at HEAD.
    pub fn file(&self, path: &str) -> Option<String> {
        self.with_history(|history| Ok(history.head_commit()?.files.get(path).cloned()))
            .unwrap_or_default()
    }

    fn with_history<T>(&self, f: impl FnOnce(&mut FakeHistory) -> Result<T>) -> Result<T> {
        let mut history = self
            .history
            .lock()
            .map_err(|_| anyhow!("fake history poisoned"))?;
        f(&mut history)
    }
}

impl FakeHistory {
    fn head_commit(&self) -> Result<&FakeCommit> {
        self.commits
            .iter()
            .find(|commit| commit.id == self.head)
            .ok_or_else(|| anyhow!("unknown head {}", self.head))
    }
}

impl Vcs for FakeVcs {
    fn current_commit(&self) -> StepFuture<'_, String> {
        Box::pin(async move { self.with_history(|history| Ok(history.head.clone())) })
    }

    fn read_file<'a>(&'a self, path: &'a str) -> StepFuture<'a, Option<String>> {
        Box::pin(async move {
            resolve_in_repo(Path::new(""), path)?;
            self.with_history(|history| Ok(history.head_commit()?.files.get(path).cloned()))
        })
    }

    fn commit_file<'a>(
        &'a self,
        path: &'a str,
        content: &'a str,
        _message: &'a str,
    ) -> StepFuture<'a, Option<String>> {
        Box::pin(async move {
            self.with_history(|history| {
                let head = history.head_commit()?;
                if head.files.get(path).map(String::as_str) == Some(content) {
                    return Ok(None);
                }
                let mut files = head.files.clone();
                files.insert(path.to_string(), content.to_string());
                let parent = Some(history.head.clone());

                let existing = history
                    .commits
                    .iter()
                    .find(|commit| commit.parent == parent && commit.files == files)
                    .map(|commit| commit.id.clone());
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let id = format!("c{}", history.commits.len());
                        history.commits.push(FakeCommit {
                            id: id.clone(),
                            parent,
                            files,
                        });
                        id
                    }
                };
                history.head = id.clone();
                Ok(Some(id))
            })
        })
    }

    fn reset_to<'a>(&'a self, commit: &'a str) -> StepFuture<'a, ()> {
        Box::pin(async move {
            self.with_history(|history| {
                if !history.commits.iter().any(|known| known.id == commit) {
                    return Err(anyhow!("unknown commit {commit}"));
                }
                history.head = commit.to_string();
                Ok(())
            })
        })
    }
}

/// A temporary git repository with one commit containing `README.md`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { dir };
        repo.git(&["init", "--quiet"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.git(&["config", "user.email", "refactorer@example.com"])?;
        repo.git(&["config", "user.name", "refactorer"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# test repo\n")?;
        repo.commit_all("chore: initial commit")?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path_of(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    pub fn write(&self, relative: &str, content: &str) -> Result<()> {
        let path = self.path_of(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "--quiet", "--no-verify", "-m", message])
    }

    /// Run git in the repository, failing on a non-zero exit.
    pub fn git(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}
