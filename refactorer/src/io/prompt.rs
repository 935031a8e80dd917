//! Prompt rendering for the planner and the file editor.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const EDIT_TEMPLATE: &str = include_str!("prompts/edit.md");

/// Inputs of a planning prompt.
#[derive(Debug, Clone)]
pub struct PlanPromptInputs<'a> {
    pub objective: &'a str,
    pub commit: &'a str,
    pub candidates: &'a [String],
    pub previously_discarded: &'a [String],
}

/// Inputs of an edit prompt for one file.
#[derive(Debug, Clone)]
pub struct EditPromptInputs<'a> {
    pub objective: &'a str,
    pub file_path: &'a str,
    pub rationale: &'a str,
    /// Current file contents; `None` when the file does not exist yet.
    pub content: Option<&'a str>,
    /// Why the previous attempt for this file was rejected.
    pub failure: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("plan", PLAN_TEMPLATE)
            .context("load plan template")?;
        env.add_template("edit", EDIT_TEMPLATE)
            .context("load edit template")?;
        Ok(Self { env })
    }

    pub fn render_plan(&self, input: &PlanPromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("plan")?;
        let rendered = template
            .render(context! {
                objective => input.objective.trim(),
                commit => input.commit,
                candidates => input.candidates,
                previously_discarded => input.previously_discarded,
            })
            .context("render plan prompt")?;
        Ok(strip_header(&rendered))
    }

    pub fn render_edit(&self, input: &EditPromptInputs<'_>) -> Result<String> {
        let template = self.env.get_template("edit")?;
        let rendered = template
            .render(context! {
                objective => input.objective.trim(),
                file_path => input.file_path,
                rationale => (!input.rationale.trim().is_empty()).then(|| input.rationale.trim()),
                content => input.content,
                failure => input.failure.map(str::trim).filter(|s| !s.is_empty()),
            })
            .context("render edit prompt")?;
        Ok(strip_header(&rendered))
    }
}

/// Drop the leading `<!-- ... -->` template comment.
fn strip_header(rendered: &str) -> String {
    let body = match rendered.trim_start().strip_prefix("<!--") {
        Some(rest) => rest.split_once("-->").map_or(rest, |(_, after)| after),
        None => rendered,
    };
    format!("{}\n", body.trim())
}
