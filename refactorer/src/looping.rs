//! The plan-execute-validate control loop behind `refactorer run`.
//!
//! Each iteration plans against the current commit, refactors the planned batch, resets
//! the tree to the batch's last accepted commit and folds the batch delta into the run
//! result. The loop ends when the planner returns nothing, repeats itself, or the budget
//! runs out.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::batch::{BatchRefactorer, rollback_to};
use crate::core::budget::BudgetExhaustedError;
use crate::core::merge::merge;
use crate::core::types::{PlanningRecord, RefactorFilesResult};
use crate::events::RefactorEvent;
use crate::io::editor::{EditOutput, EditRequest};
use crate::io::git::Vcs;
use crate::io::validation::ValidationRunner;
use crate::memo::Step;
use crate::plan::{PlanOutcome, PlanProducer, PlanRequest};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Planning,
    BatchExecuting,
    Terminated,
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStop {
    /// The planner had nothing left to change.
    Complete,
    /// The planner proposed a batch it already proposed at the same commit.
    Cycle { planned_files: Vec<String> },
    /// No further model calls may be issued.
    BudgetExhausted { spent_usd: f64 },
}

impl LoopStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStop::Complete => "complete",
            LoopStop::Cycle { .. } => "cycle",
            LoopStop::BudgetExhausted { .. } => "budget_exhausted",
        }
    }
}

/// Inputs that stay fixed for the whole run.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub objective: String,
    pub plan_model: String,
    pub candidates: Vec<String>,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub result: RefactorFilesResult,
    /// One record per planning call, in call order.
    pub planning: Vec<PlanningRecord>,
    pub stop: LoopStop,
    pub final_commit: String,
    pub iterations: u32,
    /// Sum of live edit prices across batches.
    pub edit_cost_usd: f64,
}

/// Plan, refactor, roll back and merge until the planner is done.
///
/// Any error other than budget exhaustion aborts the run with no partial result;
/// commits accepted before the error stay in history.
#[instrument(skip_all, fields(candidates = settings.candidates.len()))]
pub async fn run_loop<P, E, V, C>(
    planner: &P,
    refactorer: &BatchRefactorer<'_, E, V, C>,
    settings: &LoopSettings,
) -> Result<RunOutcome>
where
    P: PlanProducer,
    E: Step<Input = EditRequest, Output = EditOutput>,
    V: ValidationRunner,
    C: Vcs,
{
    let sink = refactorer.sink;
    let budget = refactorer.budget;
    let mut state = LoopState::Planning;
    let mut result = RefactorFilesResult::default();
    let mut planning = Vec::new();
    let mut iteration = 0u32;
    let mut edit_cost_usd = 0.0;
    let mut commit = refactorer.vcs.current_commit().await?;

    let stop = loop {
        debug!(?state, iteration, %commit, "loop state");
        if budget.is_exhausted() {
            break budget_stop(refactorer, budget.spent_usd());
        }

        iteration += 1;
        let request = PlanRequest {
            objective: settings.objective.clone(),
            commit: commit.clone(),
            candidates: settings.candidates.clone(),
            model: settings.plan_model.clone(),
            previously_discarded: result.discarded.keys().cloned().collect(),
        };
        let outcome = match planner.plan(&request, refactorer.ctx).await {
            Ok(outcome) => outcome,
            Err(err) => match err.downcast_ref::<BudgetExhaustedError>() {
                Some(exhausted) => break budget_stop(refactorer, exhausted.spent_usd),
                None => return Err(err),
            },
        };

        let response = match outcome {
            PlanOutcome::Plan {
                response,
                cache_hit,
            } => {
                sink.dispatch(RefactorEvent::PlanProduced {
                    iteration,
                    commit: commit.clone(),
                    planned_files: response.paths(),
                    cache_hit,
                });
                response
            }
            PlanOutcome::Cycle { response } => {
                let planned_files = response.paths();
                warn!(iteration, files = ?planned_files, "planner repeated itself, stopping");
                sink.dispatch(RefactorEvent::CycleDetected {
                    iteration,
                    commit: commit.clone(),
                    planned_files: planned_files.clone(),
                });
                planning.push(PlanningRecord {
                    planned_files: Vec::new(),
                    raw_response: response.raw_response,
                });
                break LoopStop::Cycle { planned_files };
            }
        };

        planning.push(response.to_record());
        if response.planned_files.is_empty() {
            info!(iteration, "planner returned no files");
            break LoopStop::Complete;
        }

        state = LoopState::BatchExecuting;
        debug!(?state, files = response.planned_files.len(), "loop state");
        let batch = refactorer
            .refactor_batch(&response.planned_files, &commit)
            .await?;
        rollback_to(refactorer.vcs, sink, &batch.last_accepted_commit).await?;
        commit = refactorer.vcs.current_commit().await?;
        result = merge(result, batch.delta);
        edit_cost_usd += batch.edit_cost_usd;

        if batch.budget_exhausted {
            break LoopStop::BudgetExhausted {
                spent_usd: budget.spent_usd(),
            };
        }
        state = LoopState::Planning;
    };

    state = LoopState::Terminated;
    info!(?state, stop = stop.as_str(), iterations = iteration, "loop finished");
    Ok(RunOutcome {
        result,
        planning,
        stop,
        final_commit: commit,
        iterations: iteration,
        edit_cost_usd,
    })
}

fn budget_stop<E, V, C>(refactorer: &BatchRefactorer<'_, E, V, C>, spent_usd: f64) -> LoopStop {
    warn!(spent_usd, "budget exhausted before planning");
    refactorer
        .sink
        .dispatch(RefactorEvent::BudgetExhausted { spent_usd });
    LoopStop::BudgetExhausted { spent_usd }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::batch::BatchSettings;
    use crate::core::budget::CostBudget;
    use crate::core::escalation::{ModelEscalation, RetryPolicy};
    use crate::events::RecordingSink;
    use crate::io::cache::MemoryCache;
    use crate::memo::StepContext;
    use crate::plan::CyclePlanner;
    use crate::test_support::{
        EDIT_COST_USD, EditReply, FakeVcs, ScriptedEditStep, ScriptedPlanStep, ScriptedValidator,
    };

    fn batch_settings() -> BatchSettings {
        BatchSettings {
            objective: "tidy".to_string(),
            edit_model: "model-a".to_string(),
            retry: RetryPolicy::new(1, ModelEscalation::default()),
            lint: Vec::new(),
            test: Vec::new(),
        }
    }

    fn loop_settings() -> LoopSettings {
        LoopSettings {
            objective: "tidy".to_string(),
            plan_model: "planner".to_string(),
            candidates: vec!["f1".to_string(), "f2".to_string()],
        }
    }

    #[tokio::test]
    async fn empty_first_plan_completes_immediately() {
        let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![vec![]]));
        let editor = ScriptedEditStep::new();
        let validator = ScriptedValidator::new();
        let vcs = FakeVcs::new(&[("f1", "one")]);
        let sink = RecordingSink::new();
        let budget = CostBudget::unlimited();
        let ctx = StepContext::in_memory();
        let settings = batch_settings();
        let refactorer = BatchRefactorer {
            editor: &editor,
            validator: &validator,
            vcs: &vcs,
            sink: &sink,
            budget: &budget,
            ctx: &ctx,
            settings: &settings,
        };

        let outcome = run_loop(&planner, &refactorer, &loop_settings())
            .await
            .expect("loop");

        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.planning.len(), 1);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.final_commit, "c0");
        assert!(outcome.result.is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_stops_before_planning() {
        let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![vec!["f1"]]));
        let editor = ScriptedEditStep::new();
        let validator = ScriptedValidator::new();
        let vcs = FakeVcs::new(&[("f1", "one")]);
        let sink = RecordingSink::new();
        let budget = CostBudget::new(Some(0.0));
        let ctx = StepContext::in_memory();
        let settings = batch_settings();
        let refactorer = BatchRefactorer {
            editor: &editor,
            validator: &validator,
            vcs: &vcs,
            sink: &sink,
            budget: &budget,
            ctx: &ctx,
            settings: &settings,
        };

        let outcome = run_loop(&planner, &refactorer, &loop_settings())
            .await
            .expect("loop");

        assert_eq!(outcome.stop, LoopStop::BudgetExhausted { spent_usd: 0.0 });
        assert_eq!(planner.step().calls(), 0);
        assert!(outcome.planning.is_empty());
        assert_eq!(
            sink.events(),
            vec![RefactorEvent::BudgetExhausted { spent_usd: 0.0 }]
        );
    }

    #[tokio::test]
    async fn planner_error_aborts_run() {
        let planner = CyclePlanner::new(ScriptedPlanStep::failing("planner crashed"));
        let editor = ScriptedEditStep::new();
        let validator = ScriptedValidator::new();
        let vcs = FakeVcs::new(&[("f1", "one")]);
        let sink = RecordingSink::new();
        let budget = CostBudget::unlimited();
        let ctx = StepContext::in_memory();
        let settings = batch_settings();
        let refactorer = BatchRefactorer {
            editor: &editor,
            validator: &validator,
            vcs: &vcs,
            sink: &sink,
            budget: &budget,
            ctx: &ctx,
            settings: &settings,
        };

        let err = run_loop(&planner, &refactorer, &loop_settings())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("planner crashed"));
    }

    #[tokio::test]
    async fn resumed_run_reports_cached_plans() {
        let store = Arc::new(MemoryCache::new());
        let editor = ScriptedEditStep::new();
        editor.reply("f1", EditReply::content("ONE"));
        let validator = ScriptedValidator::new();
        let vcs = FakeVcs::new(&[("f1", "one")]);
        let budget = CostBudget::unlimited();
        let ctx = StepContext::new(store);
        let settings = batch_settings();

        let first_sink = RecordingSink::new();
        let first = CyclePlanner::new(ScriptedPlanStep::new(vec![vec!["f1"], vec![]]));
        let refactorer = BatchRefactorer {
            editor: &editor,
            validator: &validator,
            vcs: &vcs,
            sink: &first_sink,
            budget: &budget,
            ctx: &ctx,
            settings: &settings,
        };
        let first_outcome = run_loop(&first, &refactorer, &loop_settings())
            .await
            .expect("first run");
        assert_eq!(first_outcome.edit_cost_usd, EDIT_COST_USD);

        // Resume from the start commit with the same store and a planner that was never asked.
        vcs.reset_to("c0").await.expect("reset");
        let second_sink = RecordingSink::new();
        let second = CyclePlanner::new(ScriptedPlanStep::new(Vec::new()));
        let refactorer = BatchRefactorer {
            sink: &second_sink,
            ..refactorer
        };
        let outcome = run_loop(&second, &refactorer, &loop_settings())
            .await
            .expect("second run");

        assert_eq!(second.step().calls(), 0);
        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.edit_cost_usd, 0.0);
        let plan_events: Vec<bool> = second_sink
            .events()
            .into_iter()
            .filter_map(|event| match event {
                RefactorEvent::PlanProduced { cache_hit, .. } => Some(cache_hit),
                _ => None,
            })
            .collect();
        assert_eq!(plan_events, vec![true, true]);
    }
}
