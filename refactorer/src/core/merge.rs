//! Folding per-batch results into the run-wide accumulator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::types::RefactorFilesResult;

/// Concatenate `right` onto `left`, key by key.
///
/// `accepted` merges with `accepted` and `discarded` with `discarded`. Within one key the
/// entries of `left` come first, so folding batches in chronological order keeps each
/// file's history in production order.
pub fn merge(left: RefactorFilesResult, right: RefactorFilesResult) -> RefactorFilesResult {
    let RefactorFilesResult {
        mut accepted,
        mut discarded,
    } = left;
    for (path, results) in right.accepted {
        accepted.entry(path).or_default().extend(results);
    }
    for (path, failures) in right.discarded {
        discarded.entry(path).or_default().extend(failures);
    }
    RefactorFilesResult {
        accepted,
        discarded,
    }
}

/// Final classification of a file over a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Accepted,
    Discarded,
}

/// Resolve a single status per file.
///
/// Any accepted success wins: accepted commits are never rolled back, so a file with at
/// least one success carries that edit in the final tree regardless of later discards.
pub fn file_statuses(result: &RefactorFilesResult) -> BTreeMap<String, FileStatus> {
    let mut statuses = BTreeMap::new();
    for path in result.discarded.keys() {
        statuses.insert(path.clone(), FileStatus::Discarded);
    }
    for (path, results) in &result.accepted {
        if results.iter().any(|result| result.is_success()) {
            statuses.insert(path.clone(), FileStatus::Accepted);
        } else {
            statuses
                .entry(path.clone())
                .or_insert(FileStatus::Discarded);
        }
    }
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RefactorFailure, RefactorResult, RefactorSuccess};

    fn success(path: &str, tag: &str) -> RefactorResult {
        let mut success = RefactorSuccess::new(path, Vec::new(), Vec::new());
        success.last_commit = Some(tag.to_string());
        RefactorResult::Success(success)
    }

    fn failure(path: &str, tag: &str) -> RefactorFailure {
        RefactorFailure::new(path, tag, Vec::new(), Vec::new())
    }

    fn batch(accepted: &[(&str, &str)], discarded: &[(&str, &str)]) -> RefactorFilesResult {
        let mut result = RefactorFilesResult::default();
        for (path, tag) in accepted {
            result.push_accepted(success(path, tag));
        }
        for (path, tag) in discarded {
            result.push_discarded(failure(path, tag));
        }
        result
    }

    #[test]
    fn empty_is_identity() {
        let x = batch(&[("a", "1")], &[("b", "2")]);
        assert_eq!(merge(RefactorFilesResult::default(), x.clone()), x);
        assert_eq!(merge(x.clone(), RefactorFilesResult::default()), x);
    }

    #[test]
    fn merge_is_associative() {
        let a = batch(&[("f", "a1")], &[("g", "a2")]);
        let b = batch(&[("f", "b1"), ("h", "b2")], &[]);
        let c = batch(&[("h", "c1")], &[("g", "c2"), ("f", "c3")]);

        let left = merge(merge(a.clone(), b.clone()), c.clone());
        let right = merge(a, merge(b, c));
        assert_eq!(left, right);

        let f_commits: Vec<_> = left.accepted["f"]
            .iter()
            .map(|result| result.last_commit().unwrap_or_default().to_string())
            .collect();
        assert_eq!(f_commits, vec!["a1", "b1"]);
        let g_tags: Vec<_> = left.discarded["g"]
            .iter()
            .map(|failure| failure.failure_description.clone())
            .collect();
        assert_eq!(g_tags, vec!["a2", "c2"]);
    }

    #[test]
    fn disjoint_keys_commute() {
        let a = batch(&[("a", "1")], &[]);
        let b = batch(&[("b", "2")], &[("c", "3")]);
        assert_eq!(merge(a.clone(), b.clone()), merge(b, a));
    }

    #[test]
    fn same_key_is_order_preserving_not_commutative() {
        let a = batch(&[("f", "first")], &[]);
        let b = batch(&[("f", "second")], &[]);
        assert_ne!(merge(a.clone(), b.clone()), merge(b, a));
    }

    #[test]
    fn any_success_wins_over_discards() {
        let result = merge(
            batch(&[("f", "1")], &[("g", "x")]),
            batch(&[], &[("f", "y")]),
        );
        let statuses = file_statuses(&result);
        assert_eq!(statuses["f"], FileStatus::Accepted);
        assert_eq!(statuses["g"], FileStatus::Discarded);
    }
}
