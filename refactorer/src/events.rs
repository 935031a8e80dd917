//! Run events and the sinks that observe them.
//!
//! The control loop reports progress through an injected [`EventSink`] rather than a
//! global channel. Dispatch is fire-and-forget: sinks must not block and cannot fail the
//! run. Planning notifications are emitted by the loop itself after every planning call,
//! so cache hits are observable even though the cached step body never ran.
//!
//! | Sink | Use case |
//! |------|----------|
//! | [`TracingSink`] | Structured logging via `tracing` |
//! | [`RecordingSink`] | Asserting on dispatched events in tests |

use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

/// Events emitted by the control loop and batch refactorer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RefactorEvent {
    /// A planning call returned a plan (live or from cache).
    PlanProduced {
        iteration: u32,
        commit: String,
        planned_files: Vec<String>,
        cache_hit: bool,
    },
    /// The planner repeated a previous plan without progress; the loop stops.
    CycleDetected {
        iteration: u32,
        commit: String,
        planned_files: Vec<String>,
    },
    /// An edit attempt for a file is starting.
    FileStarted {
        path: String,
        attempt: u32,
        model: String,
    },
    /// A retryable failure moved the file to a costlier model.
    ModelEscalated {
        path: String,
        from: String,
        to: String,
        reason: String,
    },
    FileAccepted {
        path: String,
        commit: Option<String>,
    },
    FileDiscarded {
        path: String,
        reason: String,
    },
    /// The working tree was reset to an accepted commit.
    RolledBack { commit: String },
    BudgetExhausted { spent_usd: f64 },
}

/// Observer of run events. Dispatch is at-most-once with no acknowledgment.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: RefactorEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn dispatch(&self, event: RefactorEvent) {
        match event {
            RefactorEvent::PlanProduced {
                iteration,
                commit,
                planned_files,
                cache_hit,
            } => info!(
                iteration,
                %commit,
                files = planned_files.len(),
                cache_hit,
                "plan produced"
            ),
            RefactorEvent::CycleDetected {
                iteration,
                planned_files,
                ..
            } => warn!(iteration, files = ?planned_files, "planning cycle detected"),
            RefactorEvent::FileStarted {
                path,
                attempt,
                model,
            } => debug!(%path, attempt, %model, "editing file"),
            RefactorEvent::ModelEscalated {
                path, from, to, ..
            } => info!(%path, %from, %to, "escalating model"),
            RefactorEvent::FileAccepted { path, commit } => {
                info!(%path, commit = ?commit, "file accepted");
            }
            RefactorEvent::FileDiscarded { path, reason } => {
                info!(%path, %reason, "file discarded");
            }
            RefactorEvent::RolledBack { commit } => debug!(%commit, "rolled back"),
            RefactorEvent::BudgetExhausted { spent_usd } => {
                warn!(spent_usd, "budget exhausted, stopping");
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RefactorEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RefactorEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn dispatch(&self, event: RefactorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
