//! Deterministic, pure logic shared by the refactorer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod cycle;
pub mod escalation;
pub mod fingerprint;
pub mod merge;
pub mod types;
