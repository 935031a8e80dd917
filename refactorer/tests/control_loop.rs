//! Loop-level tests for full refactoring runs against in-memory collaborators.
//!
//! These drive `run_loop` through planning, batch execution, rollback and merging to
//! verify termination, result shape and the events a run emits.

use std::collections::BTreeMap;

use refactorer::batch::{BatchRefactorer, BatchSettings};
use refactorer::core::budget::CostBudget;
use refactorer::core::escalation::{ModelEscalation, RetryPolicy};
use refactorer::core::types::RefactorResult;
use refactorer::events::{EventSink, RecordingSink, RefactorEvent};
use refactorer::io::validation::ScriptSpec;
use refactorer::looping::{LoopSettings, LoopStop, run_loop};
use refactorer::memo::StepContext;
use refactorer::plan::CyclePlanner;
use refactorer::test_support::{
    EditReply, FakeVcs, ScriptedEditStep, ScriptedPlanStep, ScriptedValidator,
};

fn settings(escalation: &[(&str, &str)]) -> BatchSettings {
    let map: BTreeMap<String, String> = escalation
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .collect();
    BatchSettings {
        objective: "replace unwrap with ?".to_string(),
        edit_model: "model-a".to_string(),
        retry: RetryPolicy::new(3, ModelEscalation::new(map)),
        lint: vec![ScriptSpec::new(&["lint"])],
        test: vec![ScriptSpec::new(&["test"])],
    }
}

fn loop_settings(candidates: &[&str]) -> LoopSettings {
    LoopSettings {
        objective: "replace unwrap with ?".to_string(),
        plan_model: "planner".to_string(),
        candidates: candidates.iter().map(|path| path.to_string()).collect(),
    }
}

/// End-to-end: f1 succeeds at c1, f2 exhausts its retries, the tree is rolled back to c1
/// and a re-plan comes back empty.
///
/// ```text
/// plan [f1, f2]
/// ├── f1: model-a -> "ONE" -> c1, lint+test clean     => accepted
/// └── f2: model-a unusable -> model-b unusable        => discarded
/// rollback -> c1
/// plan []                                             => complete
/// ```
#[tokio::test]
async fn end_to_end_accepts_f1_discards_f2_and_completes() {
    let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![vec!["f1", "f2"], vec![]]));
    let editor = ScriptedEditStep::new();
    editor.reply("f1", EditReply::content("ONE"));
    editor.reply("f2", EditReply::Unprocessable);
    editor.reply("f2", EditReply::Unprocessable);
    let validator = ScriptedValidator::new();
    let vcs = FakeVcs::new(&[("f1", "one"), ("f2", "two")]);
    let sink = RecordingSink::new();
    let budget = CostBudget::unlimited();
    let ctx = StepContext::in_memory();
    let settings = settings(&[("model-a", "model-b")]);
    let refactorer = BatchRefactorer {
        editor: &editor,
        validator: &validator,
        vcs: &vcs,
        sink: &sink,
        budget: &budget,
        ctx: &ctx,
        settings: &settings,
    };

    let outcome = run_loop(&planner, &refactorer, &loop_settings(&["f1", "f2"]))
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.planning.len(), 2);
    assert!(outcome.planning[1].planned_files.is_empty());
    assert_eq!(outcome.final_commit, "c1");
    assert_eq!(vcs.head(), "c1");
    assert_eq!(vcs.file("f1").as_deref(), Some("ONE"));
    assert_eq!(vcs.file("f2").as_deref(), Some("two"));

    let accepted = &outcome.result.accepted["f1"];
    assert_eq!(accepted.len(), 1);
    assert!(matches!(&accepted[0], RefactorResult::Success(s) if s.last_commit.as_deref() == Some("c1")));
    assert!(!outcome.result.accepted.contains_key("f2"));

    let discarded = &outcome.result.discarded["f2"];
    assert_eq!(discarded.len(), 1);
    assert_eq!(discarded[0].last_commit, None);
    assert!(discarded[0].failure_description.contains("after 2 attempt(s)"));

    let events = sink.events();
    let kinds: Vec<&str> = events
        .iter()
        .map(|event| match event {
            RefactorEvent::PlanProduced { .. } => "plan",
            RefactorEvent::CycleDetected { .. } => "cycle",
            RefactorEvent::FileStarted { .. } => "started",
            RefactorEvent::ModelEscalated { .. } => "escalated",
            RefactorEvent::FileAccepted { .. } => "accepted",
            RefactorEvent::FileDiscarded { .. } => "discarded",
            RefactorEvent::RolledBack { .. } => "rolled_back",
            RefactorEvent::BudgetExhausted { .. } => "budget",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "plan",
            "started",
            "accepted",
            "started",
            "escalated",
            "started",
            "discarded",
            "rolled_back",
            "rolled_back",
            "plan",
        ]
    );
}

/// A planner that keeps proposing [a, b] while every edit is rejected stops after the
/// second call, and the result holds only the first batch.
#[tokio::test]
async fn repeated_plan_without_progress_terminates() {
    let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![
        vec!["a", "b"],
        vec!["a", "b"],
        vec!["a", "b"],
    ]));
    let editor = ScriptedEditStep::new();
    editor.reply("a", EditReply::content("A"));
    editor.reply("b", EditReply::content("B"));
    let validator = ScriptedValidator::new();
    validator.fail("lint", "a", "bad a");
    validator.fail("lint", "b", "bad b");
    let vcs = FakeVcs::new(&[("a", "a"), ("b", "b")]);
    let sink = RecordingSink::new();
    let budget = CostBudget::unlimited();
    let ctx = StepContext::in_memory();
    let settings = settings(&[]);
    let refactorer = BatchRefactorer {
        editor: &editor,
        validator: &validator,
        vcs: &vcs,
        sink: &sink,
        budget: &budget,
        ctx: &ctx,
        settings: &settings,
    };

    let outcome = run_loop(&planner, &refactorer, &loop_settings(&["a", "b"]))
        .await
        .expect("run");

    assert_eq!(
        outcome.stop,
        LoopStop::Cycle {
            planned_files: vec!["a".to_string(), "b".to_string()]
        }
    );
    assert_eq!(planner.step().calls(), 2);
    assert_eq!(outcome.planning.len(), 2);
    assert!(outcome.planning[1].planned_files.is_empty());
    assert!(outcome.result.accepted.is_empty());
    assert_eq!(outcome.result.discarded["a"].len(), 1);
    assert_eq!(outcome.result.discarded["b"].len(), 1);
    assert_eq!(vcs.head(), "c0");
    assert_eq!(editor.requests().len(), 2);
    assert!(
        sink.events()
            .iter()
            .any(|event| matches!(event, RefactorEvent::CycleDetected { iteration: 2, .. }))
    );
}

/// After a batch the tree sits at the last accepted commit and holds no discarded edit.
#[tokio::test]
async fn batch_leaves_tree_at_last_accepted_commit() {
    let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![vec!["f1", "f2", "f3"]]));
    let editor = ScriptedEditStep::new();
    editor.reply("f1", EditReply::content("ONE"));
    editor.reply("f2", EditReply::content("TWO"));
    editor.reply("f3", EditReply::content("THREE"));
    let validator = ScriptedValidator::new();
    validator.fail("test", "f2", "test_two failed");
    let vcs = FakeVcs::new(&[("f1", "one"), ("f2", "two"), ("f3", "three")]);
    let sink = RecordingSink::new();
    let budget = CostBudget::unlimited();
    let ctx = StepContext::in_memory();
    let settings = settings(&[]);
    let refactorer = BatchRefactorer {
        editor: &editor,
        validator: &validator,
        vcs: &vcs,
        sink: &sink,
        budget: &budget,
        ctx: &ctx,
        settings: &settings,
    };

    let outcome = run_loop(&planner, &refactorer, &loop_settings(&["f1", "f2", "f3"]))
        .await
        .expect("run");

    let last_accepted = outcome.result.accepted["f3"]
        .last()
        .and_then(RefactorResult::last_commit)
        .expect("f3 commit")
        .to_string();
    assert_eq!(vcs.head(), last_accepted);
    assert_eq!(outcome.final_commit, last_accepted);
    assert_eq!(vcs.file("f1").as_deref(), Some("ONE"));
    assert_eq!(vcs.file("f2").as_deref(), Some("two"));
    assert_eq!(vcs.file("f3").as_deref(), Some("THREE"));
    assert_eq!(
        outcome.result.discarded["f2"][0].failure_description,
        "test failed: test"
    );
}

/// A run whose budget is spent mid-batch stops softly and keeps what it accepted.
#[tokio::test]
async fn budget_exhaustion_is_a_soft_stop() {
    let planner = CyclePlanner::new(ScriptedPlanStep::new(vec![vec!["f1", "f2"]]));
    let editor = ScriptedEditStep::new();
    editor.reply("f1", EditReply::content("ONE"));
    editor.reply("f2", EditReply::content("TWO"));
    let validator = ScriptedValidator::new();
    let vcs = FakeVcs::new(&[("f1", "one"), ("f2", "two")]);
    let sink = RecordingSink::new();
    let budget = CostBudget::new(Some(1.0));
    let ctx = StepContext::in_memory();
    let settings = settings(&[]);

    struct ChargingSink<'a> {
        inner: &'a RecordingSink,
        budget: &'a CostBudget,
    }
    impl EventSink for ChargingSink<'_> {
        fn dispatch(&self, event: RefactorEvent) {
            // Each accepted file spends the whole budget.
            if matches!(event, RefactorEvent::FileAccepted { .. }) {
                self.budget.charge(1.0);
            }
            self.inner.dispatch(event);
        }
    }
    let charging = ChargingSink {
        inner: &sink,
        budget: &budget,
    };
    let refactorer = BatchRefactorer {
        editor: &editor,
        validator: &validator,
        vcs: &vcs,
        sink: &charging,
        budget: &budget,
        ctx: &ctx,
        settings: &settings,
    };

    let outcome = run_loop(&planner, &refactorer, &loop_settings(&["f1", "f2"]))
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::BudgetExhausted { spent_usd: 1.0 });
    assert!(outcome.result.accepted.contains_key("f1"));
    assert!(!outcome.result.accepted.contains_key("f2"));
    assert!(outcome.result.discarded.is_empty());
    assert_eq!(vcs.head(), "c1");
    assert_eq!(editor.requests().len(), 1);
}
