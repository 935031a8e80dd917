//! Model escalation for retrying unprocessable model output.

use std::collections::BTreeMap;

/// One-hop mapping from a model to its costlier fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelEscalation {
    fallbacks: BTreeMap<String, String>,
}

impl ModelEscalation {
    pub fn new(fallbacks: BTreeMap<String, String>) -> Self {
        Self { fallbacks }
    }

    pub fn fallback_for(&self, model: &str) -> Option<&str> {
        self.fallbacks
            .get(model)
            .map(String::as_str)
            .filter(|fallback| *fallback != model)
    }
}

/// Decides whether a retryable failure earns another attempt, and with which model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed per file, including the first one.
    pub max_attempts: u32,
    pub escalation: ModelEscalation,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, escalation: ModelEscalation) -> Self {
        Self {
            max_attempts,
            escalation,
        }
    }

    /// Model for the next attempt after `attempt` (1-indexed) failed under `model`.
    ///
    /// Returns `None` once the attempt budget is spent or `model` has no fallback.
    pub fn next_model(&self, attempt: u32, model: &str) -> Option<String> {
        if attempt >= self.max_attempts {
            return None;
        }
        self.escalation.fallback_for(model).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, pairs: &[(&str, &str)]) -> RetryPolicy {
        let map = pairs
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        RetryPolicy::new(max_attempts, ModelEscalation::new(map))
    }

    #[test]
    fn escalates_to_mapped_model() {
        let policy = policy(3, &[("model-a", "model-b")]);
        assert_eq!(policy.next_model(1, "model-a"), Some("model-b".to_string()));
    }

    #[test]
    fn unmapped_model_stops_retrying() {
        let policy = policy(3, &[("model-a", "model-b")]);
        assert_eq!(policy.next_model(2, "model-b"), None);
    }

    #[test]
    fn attempt_budget_caps_chain() {
        let policy = policy(2, &[("a", "b"), ("b", "c")]);
        assert_eq!(policy.next_model(1, "a"), Some("b".to_string()));
        assert_eq!(policy.next_model(2, "b"), None);
    }

    #[test]
    fn self_mapping_is_not_a_fallback() {
        let escalation = ModelEscalation::new([("a".to_string(), "a".to_string())].into());
        assert_eq!(escalation.fallback_for("a"), None);
    }
}
