//! Run configuration, `refactorer.toml` by default.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::validation::ScriptSpec;

pub const DEFAULT_CONFIG_FILE: &str = "refactorer.toml";

/// What to do when the target repository has uncommitted changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirtyTreePolicy {
    /// Refuse to start.
    #[default]
    Fail,
    /// Stash the changes (untracked files included) and continue.
    Stash,
    /// Continue; uncommitted changes are lost on the first rollback.
    Ignore,
}

/// Run configuration (TOML).
///
/// Missing fields default to sensible values; `objective` has no default and is checked
/// by [`RefactorConfig::validate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefactorConfig {
    /// What the refactoring should achieve, in plain language.
    pub objective: String,

    /// Repository to refactor, relative to the config file.
    pub repo: PathBuf,

    /// Ref to start from; the current HEAD when unset.
    pub git_ref: Option<String>,

    pub dirty_tree: DirtyTreePolicy,

    /// Spend limit in USD; unlimited when unset.
    pub budget_usd: Option<f64>,

    /// Commands run once before the loop (e.g. dependency installs).
    pub bootstrap: Vec<Vec<String>>,

    pub default_model: String,

    pub models: ModelOverrides,

    /// One-hop fallback map used when a model's output is unusable.
    pub escalation: BTreeMap<String, String>,

    /// USD charged per live call, by model. Unlisted models are free.
    pub pricing: BTreeMap<String, f64>,

    /// Edit attempts per file, including the first one.
    pub max_attempts: u32,

    pub lint: Vec<ScriptSpec>,

    pub test: Vec<ScriptSpec>,

    pub candidates: CandidateFilter,

    /// Step cache location, relative to the repository.
    pub cache_dir: PathBuf,

    pub script_timeout_secs: u64,

    pub model_timeout_secs: u64,

    /// Truncate captured script and model output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Per-step model choices; `default_model` is used where unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelOverrides {
    pub plan: Option<String>,
    pub edit: Option<String>,
}

/// Which tracked files the planner may choose from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CandidateFilter {
    /// Path prefixes to include; everything when empty.
    pub include: Vec<String>,
    /// Path prefixes to exclude, applied after `include`.
    pub exclude: Vec<String>,
    /// File extensions (without the dot) to include; all when empty.
    pub extensions: Vec<String>,
}

impl CandidateFilter {
    pub fn matches(&self, path: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|prefix| path.starts_with(prefix));
        let excluded = self.exclude.iter().any(|prefix| path.starts_with(prefix));
        let extension_ok = self.extensions.is_empty()
            || Path::new(path)
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| self.extensions.iter().any(|wanted| wanted == ext));
        included && !excluded && extension_ok
    }
}

impl Default for RefactorConfig {
    fn default() -> Self {
        Self {
            objective: String::new(),
            repo: PathBuf::from("."),
            git_ref: None,
            dirty_tree: DirtyTreePolicy::default(),
            budget_usd: None,
            bootstrap: Vec::new(),
            default_model: "gpt-5-codex".to_string(),
            models: ModelOverrides::default(),
            escalation: BTreeMap::new(),
            pricing: BTreeMap::new(),
            max_attempts: 3,
            lint: Vec::new(),
            test: Vec::new(),
            candidates: CandidateFilter::default(),
            cache_dir: PathBuf::from(".refactorer/cache"),
            script_timeout_secs: 10 * 60,
            model_timeout_secs: 15 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl RefactorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.objective.trim().is_empty() {
            return Err(anyhow!("objective must be set"));
        }
        if self.default_model.trim().is_empty() {
            return Err(anyhow!("default_model must be set"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.script_timeout_secs == 0 || self.model_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if let Some(budget) = self.budget_usd
            && !(budget.is_finite() && budget >= 0.0)
        {
            return Err(anyhow!("budget_usd must be a non-negative number"));
        }
        if let Some((model, _)) = self
            .pricing
            .iter()
            .find(|(_, price)| !(price.is_finite() && **price >= 0.0))
        {
            return Err(anyhow!("pricing for {model} must be a non-negative number"));
        }
        if let Some((from, _)) = self.escalation.iter().find(|(from, to)| from == to) {
            return Err(anyhow!("escalation for {from} must name a different model"));
        }
        for (section, specs) in [("lint", &self.lint), ("test", &self.test)] {
            if specs
                .iter()
                .any(|spec| spec.args.first().is_none_or(|program| program.trim().is_empty()))
            {
                return Err(anyhow!("{section} scripts must have a non-empty args array"));
            }
        }
        if self.bootstrap.iter().any(|argv| argv.is_empty()) {
            return Err(anyhow!("bootstrap commands must be non-empty arrays"));
        }
        if self.cache_dir.is_absolute() {
            return Err(anyhow!("cache_dir must be relative to the repository"));
        }
        Ok(())
    }

    pub fn plan_model(&self) -> &str {
        self.models.plan.as_deref().unwrap_or(&self.default_model)
    }

    pub fn edit_model(&self) -> &str {
        self.models.edit.as_deref().unwrap_or(&self.default_model)
    }
}

/// Load and validate config from a TOML file. `repo` is resolved against the file's
/// directory.
pub fn load_config(path: &Path) -> Result<RefactorConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: RefactorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    if cfg.repo.is_relative() {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        cfg.repo = base.join(&cfg.repo);
    }
    Ok(cfg)
}
