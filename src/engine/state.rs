// SPDX-License-Identifier: MIT

//! Per-invocation execution state

use serde_json::Value;
use std::collections::HashMap;

/// Outputs accumulated during one invocation, keyed by action id
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    outputs: HashMap<String, Value>,
    executed: Vec<String>,
    skipped: Vec<String>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a resource's output
    pub fn record(&mut self, action_id: &str, output: Value) {
        self.outputs.insert(action_id.to_string(), output);
        self.executed.push(action_id.to_string());
    }

    pub fn mark_skipped(&mut self, action_id: &str) {
        self.skipped.push(action_id.to_string());
    }

    pub fn output(&self, action_id: &str) -> Option<&Value> {
        self.outputs.get(action_id)
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    /// Action ids in the order they ran
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_get() {
        let mut state = ExecutionState::new();
        state.record("fetch", json!({"body": {"items": [1, 2]}}));
        assert_eq!(state.output("fetch").unwrap()["body"]["items"][1], json!(2));
        assert_eq!(state.executed(), &["fetch".to_string()]);
    }

    #[test]
    fn test_skipped_not_in_outputs() {
        let mut state = ExecutionState::default();
        state.mark_skipped("b");
        assert!(state.output("b").is_none());
        assert_eq!(state.skipped(), &["b".to_string()]);
        assert!(state.outputs().is_empty());
    }
}
