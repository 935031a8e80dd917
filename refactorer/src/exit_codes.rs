//! Stable exit codes for refactorer CLI commands.

use crate::core::merge::{FileStatus, file_statuses};
use crate::looping::{LoopStop, RunOutcome};

/// Run completed (or config is valid) and every planned file was accepted.
pub const OK: i32 = 0;
/// Command failed due to invalid config, git state, or an unexpected error.
pub const INVALID: i32 = 1;
/// Run completed but at least one file ended up discarded.
pub const DISCARDED: i32 = 2;
/// Run stopped because the budget was exhausted.
pub const BUDGET_EXHAUSTED: i32 = 3;

/// Exit code for a finished run.
pub fn for_outcome(outcome: &RunOutcome) -> i32 {
    if matches!(outcome.stop, LoopStop::BudgetExhausted { .. }) {
        return BUDGET_EXHAUSTED;
    }
    let any_discarded = file_statuses(&outcome.result)
        .values()
        .any(|status| *status == FileStatus::Discarded);
    if any_discarded { DISCARDED } else { OK }
}
