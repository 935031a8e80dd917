//! Detection of plans that repeat without progress.

use std::collections::BTreeSet;

use crate::core::types::PlannedFile;

/// Remembers every `(commit, planned file set)` pair seen during a run.
///
/// A proposal is a cycle when the same set of files was already planned at the same
/// commit: the batch in between produced no net change, so executing it again would
/// repeat the same work.
#[derive(Debug, Default)]
pub struct CycleDetector {
    seen: BTreeSet<(String, Vec<String>)>,
}

impl CycleDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a plan and report whether it repeats a previous one. Empty plans never do.
    pub fn observe(&mut self, commit: &str, planned: &[PlannedFile]) -> bool {
        if planned.is_empty() {
            return false;
        }
        let key = (commit.to_string(), file_set(planned));
        !self.seen.insert(key)
    }
}

fn file_set(planned: &[PlannedFile]) -> Vec<String> {
    let set: BTreeSet<&str> = planned.iter().map(|file| file.path.as_str()).collect();
    set.into_iter().map(str::to_string).collect()
}
