//! Orchestration for preparing a repository before the control loop starts.
//!
//! Preparing a run: hides `.refactorer/` from git, applies the dirty-tree policy, creates
//! a `refactor/<run-id>` branch at the configured ref, runs bootstrap commands and lists
//! the candidate files the planner may choose from.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{CandidateFilter, DirtyTreePolicy, RefactorConfig};
use crate::io::git::Git;
use crate::io::process::run_command_with_timeout;

/// Directory (relative to the repository root) for cache and reports.
pub const STATE_DIR: &str = ".refactorer";

/// Outcome of [`prepare_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRun {
    pub run_id: String,
    pub branch: String,
    pub start_commit: String,
    pub candidates: Vec<String>,
}

/// Get `cfg.repo` ready for a run.
#[instrument(skip_all, fields(repo = %cfg.repo.display()))]
pub fn prepare_run(cfg: &RefactorConfig) -> Result<PreparedRun> {
    let root = cfg.repo.as_path();
    let git = Git::new(root);

    ensure_excluded(root, &exclude_patterns(cfg))?;
    apply_dirty_tree_policy(&git, cfg.dirty_tree)?;

    let start_point = match &cfg.git_ref {
        Some(git_ref) => git
            .resolve(git_ref)
            .with_context(|| format!("resolve git_ref {git_ref}"))?,
        None => git.head_sha()?,
    };
    let run_id = generate_run_id(&git, &start_point)?;
    let branch = format!("refactor/{run_id}");
    info!(%branch, start = %start_point, "creating run branch");
    git.checkout_new_branch(&branch, &start_point)
        .with_context(|| format!("create branch {branch}"))?;

    run_bootstrap(cfg)?;
    let start_commit = git.head_sha()?;
    if start_commit != start_point {
        return Err(anyhow!("bootstrap commands must not create commits"));
    }

    let candidates = list_candidates(&git, &cfg.candidates)?;
    info!(%run_id, candidates = candidates.len(), "run prepared");
    Ok(PreparedRun {
        run_id,
        branch,
        start_commit,
        candidates,
    })
}

/// Tracked files accepted by `filter`, in `git ls-files` order.
pub fn list_candidates(git: &Git, filter: &CandidateFilter) -> Result<Vec<String>> {
    Ok(git
        .ls_files()?
        .into_iter()
        .filter(|path| !path.starts_with(STATE_DIR) && filter.matches(path))
        .collect())
}

fn apply_dirty_tree_policy(git: &Git, policy: DirtyTreePolicy) -> Result<()> {
    if git.is_clean()? {
        return Ok(());
    }
    match policy {
        DirtyTreePolicy::Fail => git.ensure_clean(),
        DirtyTreePolicy::Stash => {
            info!("stashing uncommitted changes");
            git.stash_all("refactorer: stashed before run")
        }
        DirtyTreePolicy::Ignore => {
            warn!("working tree is dirty; uncommitted changes will be lost on rollback");
            Ok(())
        }
    }
}

fn generate_run_id(git: &Git, start_point: &str) -> Result<String> {
    let short: String = start_point.chars().take(8).collect();
    let base = format!("run-{short}");

    // Ensure uniqueness against existing local branches `refactor/<id>`.
    for suffix in 1..=999u32 {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        if !git.branch_exists(&format!("refactor/{id}"))? {
            return Ok(id);
        }
    }

    Err(anyhow!(
        "unable to generate unique run id from base '{base}' (too many existing branches)"
    ))
}

fn run_bootstrap(cfg: &RefactorConfig) -> Result<()> {
    for argv in &cfg.bootstrap {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty bootstrap command"))?;
        let label = argv.join(" ");
        debug!(command = %label, "running bootstrap command");
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&cfg.repo);
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(cfg.script_timeout_secs),
            cfg.output_limit_bytes,
        )
        .with_context(|| format!("bootstrap {label}"))?;
        if !output.success() {
            return Err(anyhow!(
                "bootstrap command `{label}` failed (status {:?}, timed out: {}): {}",
                output.status.code(),
                output.timed_out,
                output.stderr_text().trim()
            ));
        }
    }
    Ok(())
}

/// `.refactorer/` plus the cache dir when it lives elsewhere.
fn exclude_patterns(cfg: &RefactorConfig) -> Vec<String> {
    let mut patterns = vec![format!("/{STATE_DIR}/")];
    let cache_dir = cfg.cache_dir.to_string_lossy().trim_end_matches('/').to_string();
    if !cache_dir.starts_with(STATE_DIR) {
        patterns.push(format!("/{cache_dir}/"));
    }
    patterns
}

/// Add `patterns` to `.git/info/exclude` so cache and reports never dirty the tree and
/// survive `git clean` on rollback.
fn ensure_excluded(root: &Path, patterns: &[String]) -> Result<()> {
    let info_dir = root.join(".git").join("info");
    let path = info_dir.join("exclude");

    let existing = if path.exists() {
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    let missing: Vec<&String> = patterns
        .iter()
        .filter(|pattern| !existing.lines().any(|line| line.trim() == pattern.as_str()))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    fs::create_dir_all(&info_dir).with_context(|| format!("create {}", info_dir.display()))?;
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    for pattern in missing {
        updated.push_str(pattern);
        updated.push('\n');
    }
    fs::write(&path, updated).with_context(|| format!("write {}", path.display()))
}
