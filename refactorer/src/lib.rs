//! Plan-execute-validate refactoring runner.
//!
//! A planner proposes the next batch of files to change, an editor rewrites them one at a
//! time, lint and test scripts validate every commit, and failed edits are rolled back
//! before the next file. The loop repeats until the planner has nothing left, proposes
//! the same batch twice without progress, or the budget runs out. The architecture
//! enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (result merging, cycle detection, escalation,
//!   fingerprints). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process execution, model
//!   calls). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`memo`], [`plan`], [`batch`], [`looping`], [`start`]) coordinate
//! core logic with I/O to implement the `refactorer run` command.

pub mod batch;
pub mod core;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod memo;
pub mod plan;
pub mod start;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
