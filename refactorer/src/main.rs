//! `refactorer` CLI: plan, edit and validate a repository-wide refactoring.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use refactorer::batch::{BatchRefactorer, BatchSettings};
use refactorer::core::budget::CostBudget;
use refactorer::core::escalation::{ModelEscalation, RetryPolicy};
use refactorer::events::TracingSink;
use refactorer::exit_codes;
use refactorer::io::cache::FileCache;
use refactorer::io::config::{DEFAULT_CONFIG_FILE, RefactorConfig, load_config};
use refactorer::io::editor::CodexEditStep;
use refactorer::io::git::GitVcs;
use refactorer::io::model::CodexModel;
use refactorer::io::planner::CodexPlanStep;
use refactorer::io::report::{RunInfo, write_report};
use refactorer::io::validation::ScriptValidationRunner;
use refactorer::logging;
use refactorer::looping::{LoopSettings, RunOutcome, run_loop};
use refactorer::memo::StepContext;
use refactorer::plan::CyclePlanner;
use refactorer::start::{PreparedRun, STATE_DIR, prepare_run};

#[derive(Parser)]
#[command(
    name = "refactorer",
    version,
    about = "Plan-execute-validate refactoring runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prepare the repository, run the loop until done, and write a report.
    Run {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Parse and validate a config file without touching the repository.
    CheckConfig {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Run { config } => cmd_run(&config).await,
        Command::CheckConfig { config } => cmd_check_config(&config),
    }
}

fn cmd_check_config(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    println!("config ok: {}", path.display());
    println!("repo: {}", cfg.repo.display());
    println!("plan model: {}, edit model: {}", cfg.plan_model(), cfg.edit_model());
    Ok(exit_codes::OK)
}

async fn cmd_run(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    let started_at = Utc::now();
    let prepared = {
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || prepare_run(&cfg))
            .await
            .context("join run preparation")??
    };
    info!(run_id = %prepared.run_id, "starting loop");

    let budget = Arc::new(CostBudget::new(cfg.budget_usd));
    let outcome = execute_run(&cfg, &prepared, &budget).await?;

    let root = cfg.repo.as_path();
    let report = write_report(
        root,
        &RunInfo {
            run_id: prepared.run_id.clone(),
            branch: prepared.branch.clone(),
            objective: cfg.objective.clone(),
            start_commit: prepared.start_commit.clone(),
            started_at,
        },
        &outcome,
        budget.spent_usd(),
    )?;

    print_summary(&prepared, &outcome, budget.spent_usd(), &report);
    Ok(exit_codes::for_outcome(&outcome))
}

async fn execute_run(
    cfg: &RefactorConfig,
    prepared: &PreparedRun,
    budget: &Arc<CostBudget>,
) -> Result<RunOutcome> {
    let root = cfg.repo.as_path();
    let model = CodexModel {
        workdir: root.to_path_buf(),
        scratch_dir: root
            .join(STATE_DIR)
            .join("runs")
            .join(&prepared.run_id)
            .join("codex"),
        timeout: Duration::from_secs(cfg.model_timeout_secs),
        output_limit_bytes: cfg.output_limit_bytes,
        pricing: cfg.pricing.clone(),
        budget: Arc::clone(budget),
    };
    let planner = CyclePlanner::new(CodexPlanStep::new(model.clone())?);
    let editor = CodexEditStep::new(model)?;
    let validator = ScriptValidationRunner {
        workdir: root.to_path_buf(),
        timeout: Duration::from_secs(cfg.script_timeout_secs),
        output_limit_bytes: cfg.output_limit_bytes,
    };
    let vcs = GitVcs::new(root);
    let sink = TracingSink;
    let ctx = StepContext::new(Arc::new(FileCache::new(root.join(&cfg.cache_dir))));
    let settings = BatchSettings {
        objective: cfg.objective.clone(),
        edit_model: cfg.edit_model().to_string(),
        retry: RetryPolicy::new(
            cfg.max_attempts,
            ModelEscalation::new(cfg.escalation.clone()),
        ),
        lint: cfg.lint.clone(),
        test: cfg.test.clone(),
    };
    let refactorer = BatchRefactorer {
        editor: &editor,
        validator: &validator,
        vcs: &vcs,
        sink: &sink,
        budget: budget.as_ref(),
        ctx: &ctx,
        settings: &settings,
    };

    run_loop(
        &planner,
        &refactorer,
        &LoopSettings {
            objective: cfg.objective.clone(),
            plan_model: cfg.plan_model().to_string(),
            candidates: prepared.candidates.clone(),
        },
    )
    .await
}

fn print_summary(prepared: &PreparedRun, outcome: &RunOutcome, spent_usd: f64, report: &Path) {
    println!("run: {} (branch {})", prepared.run_id, prepared.branch);
    println!(
        "stopped: {} after {} iteration(s)",
        outcome.stop.as_str(),
        outcome.iterations
    );
    println!(
        "accepted: {}, discarded: {}",
        outcome.result.accepted.len(),
        outcome.result.discarded.len()
    );
    println!("final commit: {}", outcome.final_commit);
    println!(
        "spent: ${spent_usd:.2} (edits ${:.2})",
        outcome.edit_cost_usd
    );
    println!("report: {}", report.display());
}
