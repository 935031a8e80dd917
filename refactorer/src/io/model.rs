//! Structured completions through `codex exec`.
//!
//! Every call constrains the model with a JSON Schema (`--output-schema`), reads the last
//! message from `--output-last-message`, and validates it against the same schema. Output
//! that cannot be used is reported as [`UnprocessableOutputError`], which callers treat as
//! retryable; process and I/O failures stay plain errors and abort the run.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::CostBudget;
use crate::core::fingerprint::content_hash;
use crate::io::process::{CommandSpec, run_blocking};

/// The model answered, but not with something the runner can use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprocessableOutputError {
    pub model: String,
    pub reason: String,
}

impl UnprocessableOutputError {
    pub fn new(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for UnprocessableOutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unprocessable output from {}: {}", self.model, self.reason)
    }
}

impl std::error::Error for UnprocessableOutputError {}

/// A parsed completion plus the raw text it came from.
#[derive(Debug, Clone)]
pub struct Completion<T> {
    pub value: T,
    pub raw: String,
}

/// Shared settings for every `codex exec` call in a run.
#[derive(Debug, Clone)]
pub struct CodexModel {
    pub workdir: PathBuf,
    /// Where schemas and output files are written (kept out of the working tree).
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// USD charged per live call, by model.
    pub pricing: BTreeMap<String, f64>,
    pub budget: Arc<CostBudget>,
}

impl CodexModel {
    /// Run one completion and decode it as `T`.
    ///
    /// Checks the budget before spawning anything and charges it once the process ran.
    #[instrument(skip_all, fields(kind, model))]
    pub async fn complete<T: DeserializeOwned>(
        &self,
        kind: &str,
        model: &str,
        prompt: &str,
        schema: &str,
    ) -> Result<Completion<T>> {
        self.budget.ensure_available()?;

        let call_id = content_hash(&format!("{kind}\n{model}\n{prompt}"));
        let schema_path = self.scratch_dir.join(format!("{kind}.schema.json"));
        let output_path = self
            .scratch_dir
            .join("outputs")
            .join(format!("{kind}-{call_id}.json"));
        fs::create_dir_all(self.scratch_dir.join("outputs"))
            .with_context(|| format!("create {}", self.scratch_dir.display()))?;
        fs::write(&schema_path, schema)
            .with_context(|| format!("write {}", schema_path.display()))?;
        if output_path.exists() {
            fs::remove_file(&output_path)
                .with_context(|| format!("remove stale {}", output_path.display()))?;
        }

        let argv = vec![
            "codex".to_string(),
            "exec".to_string(),
            "--model".to_string(),
            model.to_string(),
            "--sandbox".to_string(),
            "read-only".to_string(),
            "--skip-git-repo-check".to_string(),
            "--output-schema".to_string(),
            schema_path.display().to_string(),
            "--output-last-message".to_string(),
            output_path.display().to_string(),
            "-".to_string(),
        ];
        let mut cmd =
            CommandSpec::from_argv(&argv, &self.workdir, self.timeout, self.output_limit_bytes)?;
        cmd.stdin = Some(prompt.as_bytes().to_vec());

        info!(kind, model, "starting codex exec");
        let output = run_blocking(cmd).await.context("run codex exec")?;
        self.budget.charge(self.price_of(model));

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "codex exec timed out");
            return Err(anyhow!("codex exec timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "codex exec failed");
            return Err(anyhow!(
                "codex exec failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }

        let raw = fs::read_to_string(&output_path).map_err(|err| {
            UnprocessableOutputError::new(model, format!("no final message written: {err}"))
        })?;
        let value = decode_output(model, &raw, schema)?;
        debug!(kind, "parsed codex output");
        Ok(Completion { value, raw })
    }

    /// USD charged for one live call to `model`.
    pub fn price_of(&self, model: &str) -> f64 {
        self.pricing.get(model).copied().unwrap_or(0.0)
    }
}

/// Parse `raw` as JSON, check it against `schema`, and decode it.
pub fn decode_output<T: DeserializeOwned>(model: &str, raw: &str, schema: &str) -> Result<T> {
    let instance: Value = serde_json::from_str(raw.trim())
        .map_err(|err| UnprocessableOutputError::new(model, format!("invalid json: {err}")))?;
    let schema: Value = serde_json::from_str(schema).context("parse output schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile output schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(&instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(UnprocessableOutputError::new(
            model,
            format!("schema violations: {}", messages.join("; ")),
        )
        .into());
    }
    serde_json::from_value(instance)
        .map_err(|err| UnprocessableOutputError::new(model, format!("decode: {err}")).into())
}
