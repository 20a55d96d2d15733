//! Run-scoped variable and result scope.
//!
//! Owned by the scheduling loop. A task's output is published here exactly
//! once, before the task is marked terminal, so every task scheduled after
//! that point observes the complete value.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Value, json};

use super::executor::ExecutorError;
use super::expression::Scope;

/// Variables plus published task results for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    variables: BTreeMap<String, Value>,
    results: HashMap<String, Value>,
    max_output_bytes: usize,
}

impl RunContext {
    /// Start from the declared variables, applying per-run overrides.
    ///
    /// Overrides may only replace declared variables.
    pub fn new(
        declared: &BTreeMap<String, Value>,
        overrides: BTreeMap<String, Value>,
        max_output_bytes: usize,
    ) -> Result<Self, ExecutorError> {
        let mut variables = declared.clone();
        for (name, value) in overrides {
            match variables.get_mut(&name) {
                Some(slot) => *slot = value,
                None => return Err(ExecutorError::UnknownVariable(name)),
            }
        }
        Ok(Self {
            variables,
            results: HashMap::new(),
            max_output_bytes,
        })
    }

    /// Publish a task's output and return what was stored.
    ///
    /// Outputs larger than the configured limit are replaced by a
    /// `_truncated` marker object.
    pub fn publish_result(&mut self, task_name: &str, output: Value) -> Value {
        let size = serde_json::to_vec(&output).map(|v| v.len()).unwrap_or(0);
        let stored = if size > self.max_output_bytes {
            tracing::warn!(
                task = task_name,
                size,
                max = self.max_output_bytes,
                "task output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!(
                    "output exceeded {} byte limit and was truncated",
                    self.max_output_bytes
                ),
            })
        } else {
            output
        };
        self.results.insert(task_name.to_string(), stored.clone());
        stored
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn has_result(&self, task_name: &str) -> bool {
        self.results.contains_key(task_name)
    }
}

impl Scope for RunContext {
    fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    fn result(&self, name: &str) -> Option<&Value> {
        self.results.get(name)
    }
}
