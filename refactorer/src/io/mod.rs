//! I/O adapters: filesystem, git, subprocesses and model calls.

pub mod cache;
pub mod config;
pub mod editor;
pub mod git;
pub mod model;
pub mod planner;
pub mod process;
pub mod prompt;
pub mod report;
pub mod validation;
