//! Plan production with cycle detection.
//!
//! The planner itself is a memoized [`Step`]; [`CyclePlanner`] wraps it, remembers every
//! plan it handed out and tags a repeat at an unchanged commit as [`PlanOutcome::Cycle`]
//! instead of returning it again.

use std::sync::Mutex;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::cycle::CycleDetector;
use crate::core::types::{PlannedFile, PlanningRecord};
use crate::memo::{Step, StepContext, StepFuture, execute};

/// Everything a planning call depends on.
///
/// The iteration number is deliberately absent: asking again at the same commit with the
/// same history is the same question and replays from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub objective: String,
    pub commit: String,
    pub candidates: Vec<String>,
    pub model: String,
    /// Files discarded earlier in the run, sorted.
    pub previously_discarded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanResponse {
    pub planned_files: Vec<PlannedFile>,
    pub raw_response: String,
}

impl PlanResponse {
    pub fn empty() -> Self {
        Self {
            planned_files: Vec::new(),
            raw_response: String::new(),
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.planned_files
            .iter()
            .map(|file| file.path.clone())
            .collect()
    }

    pub fn to_record(&self) -> PlanningRecord {
        PlanningRecord {
            planned_files: self.planned_files.clone(),
            raw_response: self.raw_response.clone(),
        }
    }
}

/// Result of one planning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Plan {
        response: PlanResponse,
        cache_hit: bool,
    },
    /// The proposal repeats an earlier plan with no progress in between.
    Cycle { response: PlanResponse },
}

/// Produces the next batch of files to refactor.
pub trait PlanProducer: Send + Sync {
    fn plan<'a>(&'a self, request: &'a PlanRequest, ctx: &'a StepContext)
    -> StepFuture<'a, PlanOutcome>;
}

/// [`PlanProducer`] over a memoized planning step.
pub struct CyclePlanner<S> {
    step: S,
    detector: Mutex<CycleDetector>,
}

impl<S> CyclePlanner<S>
where
    S: Step<Input = PlanRequest, Output = PlanResponse>,
{
    pub fn new(step: S) -> Self {
        Self {
            step,
            detector: Mutex::new(CycleDetector::new()),
        }
    }

    pub fn step(&self) -> &S {
        &self.step
    }

    #[instrument(skip_all, fields(commit = %request.commit))]
    async fn plan_once(&self, request: &PlanRequest, ctx: &StepContext) -> Result<PlanOutcome> {
        let executed = execute(&self.step, request, ctx).await?;
        let response = executed.output;

        let repeated = self
            .detector
            .lock()
            .map_err(|_| anyhow!("cycle detector lock poisoned"))?
            .observe(&request.commit, &response.planned_files);
        if repeated {
            debug!(files = ?response.paths(), "plan repeats an earlier proposal");
            return Ok(PlanOutcome::Cycle { response });
        }

        Ok(PlanOutcome::Plan {
            response,
            cache_hit: executed.cache_hit,
        })
    }
}

impl<S> PlanProducer for CyclePlanner<S>
where
    S: Step<Input = PlanRequest, Output = PlanResponse>,
{
    fn plan<'a>(
        &'a self,
        request: &'a PlanRequest,
        ctx: &'a StepContext,
    ) -> StepFuture<'a, PlanOutcome> {
        Box::pin(self.plan_once(request, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedPlanStep;

    fn request(commit: &str, discarded: &[&str]) -> PlanRequest {
        PlanRequest {
            objective: "tidy".to_string(),
            commit: commit.to_string(),
            candidates: vec!["a".to_string(), "b".to_string()],
            model: "m".to_string(),
            previously_discarded: discarded.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn repeated_plan_at_same_commit_is_a_cycle() {
        let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![
            vec!["a", "b"],
            vec!["b", "a"],
        ]));
        let ctx = StepContext::in_memory();

        let first = planner.plan(&request("c0", &[]), &ctx).await.expect("plan");
        assert!(matches!(first, PlanOutcome::Plan { cache_hit: false, .. }));

        let second = planner
            .plan(&request("c0", &["a", "b"]), &ctx)
            .await
            .expect("plan");
        assert!(matches!(second, PlanOutcome::Cycle { .. }));
    }

    #[tokio::test]
    async fn same_plan_after_progress_is_not_a_cycle() {
        let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![vec!["a"], vec!["a"]]));
        let ctx = StepContext::in_memory();

        planner.plan(&request("c0", &[]), &ctx).await.expect("plan");
        let second = planner.plan(&request("c1", &[]), &ctx).await.expect("plan");
        assert!(matches!(second, PlanOutcome::Plan { .. }));
    }

    #[tokio::test]
    async fn identical_request_replays_from_cache_and_cycles() {
        let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![vec!["a"]]));
        let ctx = StepContext::in_memory();

        planner.plan(&request("c0", &[]), &ctx).await.expect("plan");
        let second = planner.plan(&request("c0", &[]), &ctx).await.expect("plan");

        assert_eq!(planner.step().calls(), 1);
        assert!(matches!(second, PlanOutcome::Cycle { .. }));
    }

    #[tokio::test]
    async fn empty_plan_is_never_a_cycle() {
        let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![vec![], vec![]]));
        let ctx = StepContext::in_memory();

        planner.plan(&request("c0", &[]), &ctx).await.expect("plan");
        let second = planner
            .plan(&request("c0", &["x"]), &ctx)
            .await
            .expect("plan");
        assert!(matches!(second, PlanOutcome::Plan { .. }));
    }
}
