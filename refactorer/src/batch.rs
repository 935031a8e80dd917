//! Refactor-then-validate for one planned batch.
//!
//! Files are handled strictly in plan order, one at a time. Each file gets an edit from
//! the model, a commit, then lint and test validation against that commit. A file that
//! fails is discarded and the tree is reset to the last accepted commit before the next
//! file starts, so accepted work never builds on a rejected edit.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{BudgetExhaustedError, CostBudget};
use crate::core::escalation::RetryPolicy;
use crate::core::types::{
    Issue, PlannedFile, RefactorFailure, RefactorFilesResult, RefactorResult, RefactorStepResult,
    RefactorSuccess,
};
use crate::events::{EventSink, RefactorEvent};
use crate::io::editor::{EditOutput, EditRequest};
use crate::io::git::{UnusableFileError, Vcs};
use crate::io::model::UnprocessableOutputError;
use crate::io::validation::{ScriptSpec, ValidateStep, ValidationInput, ValidationRunner};
use crate::memo::{Step, StepContext, execute};

/// Per-run settings the batch refactorer needs.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub objective: String,
    /// Model used for the first attempt on every file.
    pub edit_model: String,
    pub retry: RetryPolicy,
    pub lint: Vec<ScriptSpec>,
    pub test: Vec<ScriptSpec>,
}

/// What one batch produced.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub delta: RefactorFilesResult,
    /// Commit the tree is left at: the last accepted file's commit, or the batch start.
    pub last_accepted_commit: String,
    pub budget_exhausted: bool,
    /// Price of the live edit calls that produced content; cache replays are free.
    pub edit_cost_usd: f64,
}

/// Collaborators for refactoring a batch.
pub struct BatchRefactorer<'r, E, V, C> {
    pub editor: &'r E,
    pub validator: &'r V,
    pub vcs: &'r C,
    pub sink: &'r dyn EventSink,
    pub budget: &'r CostBudget,
    pub ctx: &'r StepContext,
    pub settings: &'r BatchSettings,
}

/// Result of validating one committed edit.
struct Validated {
    issues: Vec<Issue>,
    /// First blocking category and command, when any issue was found.
    blocking: Option<String>,
}

impl<E, V, C> BatchRefactorer<'_, E, V, C>
where
    E: Step<Input = EditRequest, Output = EditOutput>,
    V: ValidationRunner,
    C: Vcs,
{
    /// Refactor `files` in order, starting from `start_commit`.
    ///
    /// Unexpected errors abort the batch; commits accepted before the error remain.
    #[instrument(skip_all, fields(files = files.len(), start = %start_commit))]
    pub async fn refactor_batch(
        &self,
        files: &[PlannedFile],
        start_commit: &str,
    ) -> Result<BatchOutcome> {
        let mut delta = RefactorFilesResult::default();
        let mut last_accepted = start_commit.to_string();
        let mut budget_exhausted = false;
        let mut edit_cost_usd = 0.0;

        for file in files {
            match self.refactor_file(file, &mut edit_cost_usd).await {
                Ok(RefactorResult::Success(success)) => {
                    if let Some(commit) = &success.last_commit {
                        last_accepted = commit.clone();
                    }
                    self.sink.dispatch(RefactorEvent::FileAccepted {
                        path: file.path.clone(),
                        commit: success.last_commit.clone(),
                    });
                    delta.push_accepted(RefactorResult::Success(success));
                }
                Ok(RefactorResult::Failure(failure)) => {
                    self.sink.dispatch(RefactorEvent::FileDiscarded {
                        path: file.path.clone(),
                        reason: failure.failure_description.clone(),
                    });
                    delta.push_discarded(failure);
                    rollback_to(self.vcs, self.sink, &last_accepted).await?;
                }
                Err(err) => {
                    let Some(exhausted) = err.downcast_ref::<BudgetExhaustedError>() else {
                        return Err(err);
                    };
                    warn!(path = %file.path, %exhausted, "budget exhausted mid-batch");
                    self.sink.dispatch(RefactorEvent::BudgetExhausted {
                        spent_usd: exhausted.spent_usd,
                    });
                    rollback_to(self.vcs, self.sink, &last_accepted).await?;
                    budget_exhausted = true;
                    break;
                }
            }
        }

        Ok(BatchOutcome {
            delta,
            last_accepted_commit: last_accepted,
            budget_exhausted,
            edit_cost_usd,
        })
    }

    /// Edit, commit and validate one file, escalating the model on unusable output.
    ///
    /// A planned path that cannot be edited as text is discarded without calling the model.
    #[instrument(skip_all, fields(path = %file.path))]
    pub async fn refactor_file(
        &self,
        file: &PlannedFile,
        edit_cost_usd: &mut f64,
    ) -> Result<RefactorResult> {
        let original = match self.vcs.read_file(&file.path).await {
            Ok(original) => original,
            Err(err) => {
                let Some(unusable) = err.downcast_ref::<UnusableFileError>() else {
                    return Err(err);
                };
                warn!(%unusable, "planned file cannot be edited");
                return Ok(RefactorResult::Failure(RefactorFailure::new(
                    &file.path,
                    unusable.to_string(),
                    Vec::new(),
                    Vec::new(),
                )));
            }
        };
        let mut model = self.settings.edit_model.clone();
        let mut failure: Option<String> = None;
        let mut steps = Vec::new();
        let mut attempt = 1;

        loop {
            self.budget.ensure_available()?;
            self.sink.dispatch(RefactorEvent::FileStarted {
                path: file.path.clone(),
                attempt,
                model: model.clone(),
            });

            let request = EditRequest {
                objective: self.settings.objective.clone(),
                file_path: file.path.clone(),
                rationale: file.rationale.clone(),
                content: original.clone(),
                failure: failure.clone(),
                model: model.clone(),
            };
            let err = match self.attempt(file, &request, &mut steps, edit_cost_usd).await {
                Ok(validated) => return Ok(self.conclude(file, validated, steps)),
                Err(err) => err,
            };
            let Some(unprocessable) = err.downcast_ref::<UnprocessableOutputError>() else {
                return Err(err);
            };
            let reason = unprocessable.to_string();

            let Some(next) = self.settings.retry.next_model(attempt, &model) else {
                info!(attempt, %reason, "no retry left");
                let description = format!("model output unusable after {attempt} attempt(s): {reason}");
                return Ok(RefactorResult::Failure(RefactorFailure::new(
                    &file.path,
                    description,
                    Vec::new(),
                    steps,
                )));
            };
            self.sink.dispatch(RefactorEvent::ModelEscalated {
                path: file.path.clone(),
                from: model.clone(),
                to: next.clone(),
                reason: reason.clone(),
            });
            model = next;
            failure = Some(reason);
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        file: &PlannedFile,
        request: &EditRequest,
        steps: &mut Vec<RefactorStepResult>,
        edit_cost_usd: &mut f64,
    ) -> Result<Validated> {
        let edited = execute(self.editor, request, self.ctx).await?;
        if edited.cache_hit {
            debug!("edit replayed from cache");
        } else {
            *edit_cost_usd += edited.output.cost_usd;
        }
        let content = edited.output.content;

        let message = commit_message(file, &self.settings.objective);
        let commit = self
            .vcs
            .commit_file(&file.path, &content, &message)
            .await?
            .ok_or_else(|| UnprocessableOutputError::new(&request.model, "edit changed nothing"))?;
        steps.push(RefactorStepResult {
            task: message,
            file_contents: content,
            commit: commit.clone(),
        });

        self.validate(&file.path, &commit).await
    }

    /// Lint first; tests only run on a lint-clean commit.
    async fn validate(&self, path: &str, commit: &str) -> Result<Validated> {
        let validate = ValidateStep::new(self.validator);
        let changed_files = vec![path.to_string()];

        for (category, specs) in [("lint", &self.settings.lint), ("test", &self.settings.test)] {
            let mut issues = Vec::new();
            let mut blocking = None;
            for spec in specs {
                let input = ValidationInput {
                    spec: spec.clone(),
                    changed_files: changed_files.clone(),
                    commit: commit.to_string(),
                };
                let found = execute(&validate, &input, self.ctx).await?.output;
                if !found.is_empty() && blocking.is_none() {
                    blocking = Some(format!("{category} failed: {}", spec.command_line()));
                }
                issues.extend(found);
            }
            if !issues.is_empty() {
                return Ok(Validated { issues, blocking });
            }
        }

        Ok(Validated {
            issues: Vec::new(),
            blocking: None,
        })
    }

    fn conclude(
        &self,
        file: &PlannedFile,
        validated: Validated,
        steps: Vec<RefactorStepResult>,
    ) -> RefactorResult {
        match validated.blocking {
            None => RefactorResult::Success(RefactorSuccess::new(
                &file.path,
                validated.issues,
                steps,
            )),
            Some(description) => RefactorResult::Failure(RefactorFailure::new(
                &file.path,
                description,
                validated.issues,
                steps,
            )),
        }
    }
}

/// Reset the working tree to `commit` and report it.
pub async fn rollback_to<C: Vcs>(vcs: &C, sink: &dyn EventSink, commit: &str) -> Result<()> {
    vcs.reset_to(commit).await?;
    debug!(%commit, "working tree reset");
    sink.dispatch(RefactorEvent::RolledBack {
        commit: commit.to_string(),
    });
    Ok(())
}

fn commit_message(file: &PlannedFile, objective: &str) -> String {
    let summary = objective.lines().next().unwrap_or_default().trim();
    if file.rationale.trim().is_empty() {
        format!("refactor({}): {summary}", file.path)
    } else {
        format!("refactor({}): {summary}\n\n{}", file.path, file.rationale.trim())
    }
}
