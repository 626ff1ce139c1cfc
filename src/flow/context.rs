use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a completed node exposes to templates as `{{<id>.<field>}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    pub output: String,
}

impl NodeResult {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// Results of the nodes completed so far in one run. Each node is written once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    results: BTreeMap<String, NodeResult>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of `node_id`. Returns `false` and keeps the first
    /// value if the node already has one.
    pub fn record(&mut self, node_id: impl Into<String>, output: impl Into<String>) -> bool {
        let node_id = node_id.into();
        if self.results.contains_key(&node_id) {
            return false;
        }
        self.results.insert(node_id, NodeResult::new(output));
        true
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeResult> {
        self.results.get(node_id)
    }

    pub fn output(&self, node_id: &str) -> Option<&str> {
        self.get(node_id).map(|result| result.output.as_str())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Anything a template path can be walked through.
pub trait PathLookup {
    fn lookup(&self, path: &[&str]) -> Option<Value>;
}

impl PathLookup for Value {
    fn lookup(&self, path: &[&str]) -> Option<Value> {
        let mut current = self;
        for segment in path {
            current = match current {
                Value::Object(map) => map.get(*segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

impl PathLookup for ExecutionContext {
    fn lookup(&self, path: &[&str]) -> Option<Value> {
        let (node_id, rest) = path.split_first()?;
        let result = self.results.get(*node_id)?;

        match rest {
            ["output"] => Some(Value::String(result.output.clone())),
            _ => serde_json::to_value(result).ok()?.lookup(rest),
        }
    }
}
