//! File editing step backed by `codex exec`.
//!
//! The model only proposes new contents; writing and committing them is the batch
//! refactorer's job, so this step stays free of working-tree side effects and can be
//! replayed from the cache.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::io::model::{CodexModel, UnprocessableOutputError};
use crate::io::prompt::{EditPromptInputs, PromptEngine};
use crate::memo::{Step, StepContext, StepFuture};

pub const EDIT_OUTPUT_SCHEMA: &str = include_str!("../../schemas/edit_output.schema.json");

/// Everything one edit attempt depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRequest {
    pub objective: String,
    pub file_path: String,
    pub rationale: String,
    /// Contents at the last accepted commit; `None` for a new file.
    pub content: Option<String>,
    /// Why the previous attempt was rejected, if this is a retry.
    pub failure: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOutput {
    pub content: String,
    /// Cost of the live call that produced this output.
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    content: String,
}

/// Asks the model for the new contents of one file.
pub struct CodexEditStep {
    model: CodexModel,
    prompts: PromptEngine,
}

impl CodexEditStep {
    pub fn new(model: CodexModel) -> Result<Self> {
        Ok(Self {
            model,
            prompts: PromptEngine::new()?,
        })
    }

    #[instrument(skip_all, fields(path = %input.file_path, model = %input.model))]
    async fn edit(&self, input: &EditRequest) -> Result<EditOutput> {
        let prompt = self.prompts.render_edit(&EditPromptInputs {
            objective: &input.objective,
            file_path: &input.file_path,
            rationale: &input.rationale,
            content: input.content.as_deref(),
            failure: input.failure.as_deref(),
        })?;
        let completion = self
            .model
            .complete::<EditResponse>("edit", &input.model, &prompt, EDIT_OUTPUT_SCHEMA)
            .await?;
        let content = completion.value.content;
        if content.trim().is_empty() {
            return Err(UnprocessableOutputError::new(&input.model, "empty file contents").into());
        }

        debug!(bytes = content.len(), "editor answered");
        Ok(EditOutput {
            content,
            cost_usd: self.model.price_of(&input.model),
        })
    }
}

impl Step for CodexEditStep {
    type Input = EditRequest;
    type Output = EditOutput;

    fn name(&self) -> &str {
        "edit"
    }

    fn run<'a>(&'a self, input: &'a EditRequest, _ctx: &'a StepContext) -> StepFuture<'a, EditOutput> {
        Box::pin(self.edit(input))
    }
}
