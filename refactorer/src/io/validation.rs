//! Lint and test script execution.
//!
//! A script passes when it exits successfully. On failure its output (from the configured
//! channel) is parsed into [`Issue`]s attributed to the commit under validation.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, debug_span};

use crate::core::types::Issue;
use crate::io::process::{CommandSpec, run_blocking};
use crate::memo::{Step, StepContext, StepFuture};

pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// Issue code for a script killed at its timeout.
pub const TIMEOUT_CODE: &str = "timeout";

/// Number of trailing output lines kept when no issue could be parsed.
const FALLBACK_TAIL_LINES: usize = 20;

/// Which stream carries the script's diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputChannel {
    #[default]
    Stdout,
    Stderr,
    Both,
}

/// A lint or test script (e.g. `["cargo", "clippy"]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub args: Vec<String>,
    #[serde(default)]
    pub parse: OutputChannel,
    /// Whether changed file paths may be appended to scope the run.
    #[serde(default)]
    pub supports_file_list: bool,
}

impl ScriptSpec {
    pub fn new(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(|arg| arg.to_string()).collect(),
            parse: OutputChannel::Stdout,
            supports_file_list: false,
        }
    }

    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }

    /// Full argv, scoped to `changed_files` when the script supports it.
    pub fn argv(&self, changed_files: &[String]) -> Vec<String> {
        let mut argv = self.args.clone();
        if self.supports_file_list {
            argv.extend(changed_files.iter().cloned());
        }
        argv
    }
}

/// Runs a validation script against the current working tree.
pub trait ValidationRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        spec: &'a ScriptSpec,
        changed_files: &'a [String],
        commit: &'a str,
    ) -> StepFuture<'a, Vec<Issue>>;
}

/// Runs scripts as subprocesses in the repository root.
#[derive(Debug, Clone)]
pub struct ScriptValidationRunner {
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl ScriptValidationRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_SCRIPT_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl ScriptValidationRunner {
    async fn run_script(
        &self,
        spec: &ScriptSpec,
        changed_files: &[String],
        commit: &str,
    ) -> Result<Vec<Issue>> {
        let command = spec.command_line();
        let cmd = CommandSpec::from_argv(
            &spec.argv(changed_files),
            &self.workdir,
            self.timeout,
            self.output_limit_bytes,
        )?;
        let output = run_blocking(cmd).await?;

        if output.timed_out {
            return Ok(vec![Issue {
                command,
                issue: format!("timed out after {:?}", self.timeout),
                file_path: changed_files.first().cloned().unwrap_or_default(),
                commit: commit.to_string(),
                code: Some(TIMEOUT_CODE.to_string()),
            }]);
        }
        if output.status.success() {
            debug!("script passed");
            return Ok(Vec::new());
        }

        let text = match spec.parse {
            OutputChannel::Stdout => output.stdout_text(),
            OutputChannel::Stderr => output.stderr_text(),
            OutputChannel::Both => format!("{}\n{}", output.stdout_text(), output.stderr_text()),
        };
        let mut issues = parse_issues(&text, &command, commit);
        if issues.is_empty() {
            issues.push(Issue {
                command,
                issue: format!(
                    "exited with status {:?}:\n{}",
                    output.status.code(),
                    tail(&text, FALLBACK_TAIL_LINES)
                ),
                file_path: changed_files.first().cloned().unwrap_or_default(),
                commit: commit.to_string(),
                code: None,
            });
        }
        debug!(issues = issues.len(), "script failed");
        Ok(issues)
    }
}

impl ValidationRunner for ScriptValidationRunner {
    fn run<'a>(
        &'a self,
        spec: &'a ScriptSpec,
        changed_files: &'a [String],
        commit: &'a str,
    ) -> StepFuture<'a, Vec<Issue>> {
        let span = debug_span!(
            "validate",
            command = %spec.command_line(),
            files = changed_files.len()
        );
        Box::pin(self.run_script(spec, changed_files, commit).instrument(span))
    }
}

/// Cacheable input of a validation run: same script, files and commit give the same issues.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationInput {
    pub spec: ScriptSpec,
    pub changed_files: Vec<String>,
    pub commit: String,
}

/// Adapts a [`ValidationRunner`] to the step framework.
pub struct ValidateStep<'r, V> {
    runner: &'r V,
}

impl<'r, V: ValidationRunner> ValidateStep<'r, V> {
    pub fn new(runner: &'r V) -> Self {
        Self { runner }
    }
}

impl<V: ValidationRunner> Step for ValidateStep<'_, V> {
    type Input = ValidationInput;
    type Output = Vec<Issue>;

    fn name(&self) -> &str {
        "validate"
    }

    fn run<'a>(
        &'a self,
        input: &'a ValidationInput,
        _ctx: &'a StepContext,
    ) -> StepFuture<'a, Vec<Issue>> {
        self.runner
            .run(&input.spec, &input.changed_files, &input.commit)
    }

    /// A timeout may be transient, so it blocks this attempt but is never replayed.
    fn should_cache(&self, issues: &Vec<Issue>) -> bool {
        !issues
            .iter()
            .any(|issue| issue.code.as_deref() == Some(TIMEOUT_CODE))
    }
}

/// Extract `path:line[:col]: message` diagnostics, plus rustc-style `error[CODE]: msg`
/// headers followed by a `--> path:line:col` location line.
pub fn parse_issues(text: &str, command: &str, commit: &str) -> Vec<Issue> {
    static LOCATED: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*(?P<path>[^\s:][^:]*?):(?P<line>\d+)(?::(?P<col>\d+))?:?\s+(?P<msg>\S.*)$")
            .expect("issue regex is valid")
    });
    static HEADER: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(?P<level>error|warning)(?:\[(?P<code>[A-Za-z0-9_-]+)\])?:\s+(?P<msg>.+)$")
            .expect("issue regex is valid")
    });
    static ARROW: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^\s*-->\s+(?P<path>[^:]+):(?P<line>\d+)(?::\d+)?")
            .expect("issue regex is valid")
    });

    let mut issues = Vec::new();
    let mut pending: Option<(String, Option<String>)> = None;

    for line in text.lines() {
        if let Some(caps) = HEADER.captures(line) {
            // Warnings never block; only their location lines need to be skipped.
            pending = (&caps["level"] == "error").then(|| {
                (
                    caps["msg"].trim().to_string(),
                    caps.name("code").map(|code| code.as_str().to_string()),
                )
            });
            continue;
        }
        if let Some(caps) = ARROW.captures(line) {
            if let Some((msg, code)) = pending.take() {
                issues.push(Issue {
                    command: command.to_string(),
                    issue: format!("{}:{}: {}", &caps["path"], &caps["line"], msg),
                    file_path: caps["path"].trim().to_string(),
                    commit: commit.to_string(),
                    code,
                });
            }
            continue;
        }
        if let Some(caps) = LOCATED.captures(line) {
            let msg = caps["msg"].trim().to_string();
            issues.push(Issue {
                command: command.to_string(),
                issue: format!("{}:{}: {}", &caps["path"], &caps["line"], msg),
                file_path: caps["path"].trim().to_string(),
                commit: commit.to_string(),
                code: extract_code(&msg),
            });
        }
    }
    issues
}

fn extract_code(message: &str) -> Option<String> {
    static CODE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\b(?P<ts>TS\d{4,5})\b|\[(?P<bracket>[A-Za-z0-9/@_-]+)\]\s*$|^(?:error|warning)\[(?P<rust>[A-Z]\d{4})\]")
            .expect("issue regex is valid")
    });
    let caps = CODE.captures(message)?;
    caps.name("ts")
        .or_else(|| caps.name("bracket"))
        .or_else(|| caps.name("rust"))
        .map(|m| m.as_str().to_string())
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
