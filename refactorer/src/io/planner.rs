//! Planning step backed by `codex exec`.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::core::types::PlannedFile;
use crate::io::model::CodexModel;
use crate::io::prompt::{PlanPromptInputs, PromptEngine};
use crate::memo::{Step, StepContext, StepFuture};
use crate::plan::{PlanRequest, PlanResponse};

pub const PLAN_OUTPUT_SCHEMA: &str = include_str!("../../schemas/plan_output.schema.json");

#[derive(Debug, Deserialize)]
struct PlanOutput {
    planned_files: Vec<PlannedFile>,
}

/// Asks the model which files to change next.
pub struct CodexPlanStep {
    model: CodexModel,
    prompts: PromptEngine,
}

impl CodexPlanStep {
    pub fn new(model: CodexModel) -> Result<Self> {
        Ok(Self {
            model,
            prompts: PromptEngine::new()?,
        })
    }

    #[instrument(skip_all, fields(model = %input.model, candidates = input.candidates.len()))]
    async fn plan(&self, input: &PlanRequest) -> Result<PlanResponse> {
        let prompt = self.prompts.render_plan(&PlanPromptInputs {
            objective: &input.objective,
            commit: &input.commit,
            candidates: &input.candidates,
            previously_discarded: &input.previously_discarded,
        })?;
        let completion = self
            .model
            .complete::<PlanOutput>("plan", &input.model, &prompt, PLAN_OUTPUT_SCHEMA)
            .await?;

        let planned_files = dedup_paths(completion.value.planned_files);
        debug!(files = planned_files.len(), "planner answered");
        Ok(PlanResponse {
            planned_files,
            raw_response: completion.raw,
        })
    }
}

impl Step for CodexPlanStep {
    type Input = PlanRequest;
    type Output = PlanResponse;

    fn name(&self) -> &str {
        "plan"
    }

    fn run<'a>(
        &'a self,
        input: &'a PlanRequest,
        _ctx: &'a StepContext,
    ) -> StepFuture<'a, PlanResponse> {
        Box::pin(self.plan(input))
    }
}

/// Keep the first occurrence of each path, in plan order.
fn dedup_paths(files: Vec<PlannedFile>) -> Vec<PlannedFile> {
    let mut seen = BTreeSet::new();
    files
        .into_iter()
        .filter(|file| seen.insert(file.path.clone()))
        .collect()
}
