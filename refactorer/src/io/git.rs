//! Git adapter for the refactor loop.
//!
//! [`Git`] is a small, explicit wrapper around blocking `git` subprocess calls. [`Vcs`] is
//! the async working-tree interface the loop depends on; [`GitVcs`] implements it by
//! running [`Git`] on tokio's blocking pool.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::memo::StepFuture;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// A planned path that cannot be edited as text: outside the repository or not UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnusableFileError {
    pub path: String,
    pub reason: String,
}

impl UnusableFileError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for UnusableFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path '{}' {}", self.path, self.reason)
    }
}

impl std::error::Error for UnusableFileError {}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Resolve any revision (branch, tag, sha) to a full commit SHA.
    pub fn resolve(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        Ok(self
            .run_capture(&["rev-parse", "--verify", &spec])?
            .trim()
            .to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn is_clean(&self) -> Result<bool> {
        Ok(self.status_porcelain()?.is_empty())
    }

    /// Ensure the worktree is fully clean (including untracked files).
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Stash all changes including untracked files.
    pub fn stash_all(&self, message: &str) -> Result<()> {
        self.run_checked(&["stash", "push", "--include-untracked", "-m", message])?;
        Ok(())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch starting at `start_point`.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        debug!(branch, start_point, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch, start_point])?;
        Ok(())
    }

    /// Tracked files, repository-relative.
    pub fn ls_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-files", "-z"])?;
        Ok(out
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Stage a single path.
    pub fn add_path(&self, path: &str) -> Result<()> {
        self.run_checked(&["add", "--", path])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "--no-verify", "-m", message])?;
        Ok(true)
    }

    /// Hard-reset tracked files to `commit` and drop untracked (non-ignored) files.
    #[instrument(skip_all, fields(commit))]
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        debug!(commit, "resetting working tree");
        self.run_checked(&["reset", "--hard", commit])?;
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Working-tree operations the control loop performs.
///
/// The loop is the sole coordinator: commits and resets are issued one at a time and a
/// reset never overlaps an edit.
pub trait Vcs: Send + Sync {
    fn current_commit(&self) -> StepFuture<'_, String>;

    /// Read a file from the working tree; `None` if it does not exist.
    fn read_file<'a>(&'a self, path: &'a str) -> StepFuture<'a, Option<String>>;

    /// Write `content` to `path` and commit it. Returns `None` when nothing changed.
    fn commit_file<'a>(
        &'a self,
        path: &'a str,
        content: &'a str,
        message: &'a str,
    ) -> StepFuture<'a, Option<String>>;

    /// Reset the working tree to `commit`, discarding everything after it.
    fn reset_to<'a>(&'a self, commit: &'a str) -> StepFuture<'a, ()>;
}

/// [`Vcs`] backed by a real git checkout.
#[derive(Debug, Clone)]
pub struct GitVcs {
    git: Git,
}

impl GitVcs {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            git: Git::new(workdir),
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }
}

impl Vcs for GitVcs {
    fn current_commit(&self) -> StepFuture<'_, String> {
        let git = self.git.clone();
        Box::pin(blocking(move || git.head_sha()))
    }

    fn read_file<'a>(&'a self, path: &'a str) -> StepFuture<'a, Option<String>> {
        let git = self.git.clone();
        let path = path.to_string();
        Box::pin(blocking(move || {
            let full = resolve_in_repo(git.workdir(), &path)?;
            if !full.exists() {
                return Ok(None);
            }
            let bytes = fs::read(&full).with_context(|| format!("read {}", full.display()))?;
            let content = String::from_utf8(bytes)
                .map_err(|_| UnusableFileError::new(&path, "is not valid UTF-8 text"))?;
            Ok(Some(content))
        }))
    }

    fn commit_file<'a>(
        &'a self,
        path: &'a str,
        content: &'a str,
        message: &'a str,
    ) -> StepFuture<'a, Option<String>> {
        let git = self.git.clone();
        let (path, content, message) = (path.to_string(), content.to_string(), message.to_string());
        Box::pin(blocking(move || {
            let full = resolve_in_repo(git.workdir(), &path)?;
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&full, content).with_context(|| format!("write {}", full.display()))?;
            git.add_path(&path)?;
            if !git.commit_staged(&message)? {
                return Ok(None);
            }
            Ok(Some(git.head_sha()?))
        }))
    }

    fn reset_to<'a>(&'a self, commit: &'a str) -> StepFuture<'a, ()> {
        let git = self.git.clone();
        let commit = commit.to_string();
        Box::pin(blocking(move || git.reset_hard(&commit)))
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("join blocking git task")?
}

/// Join a repository-relative path onto `root`, refusing paths that escape it.
pub fn resolve_in_repo(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    let escapes = candidate.components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if relative.trim().is_empty() || escapes {
        return Err(UnusableFileError::new(relative, "is not inside the repository").into());
    }
    Ok(root.join(candidate))
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
