//! Workflow definition format.
//!
//! A `WorkflowDefinition` is the declarative JSON (or YAML) document the engine
//! validates and runs: named tasks, their dependency edges, per-task error
//! handling, conditional branches and manual approval gates. Field names are
//! camelCase on the wire; enum values are PascalCase.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The declarative workflow document.
///
/// Immutable once validated; a run never mutates its definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Variables available to expressions as `Variables('Name')`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    /// Run-wide settings.
    #[serde(default)]
    pub configuration: WorkflowConfiguration,
    /// Ordered task list. Definition order breaks scheduling ties.
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    /// Look up a task by name.
    pub fn task(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// Global `configuration` block of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfiguration {
    /// Maximum number of concurrently running tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degree_of_parallelism: Option<u32>,
    /// Ceiling for the whole run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_milliseconds: Option<u64>,
    /// Default error handling for tasks that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
}

// ---------------------------------------------------------------------------
// Task Definition
// ---------------------------------------------------------------------------

/// A single task in the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Unique PascalCase verb-noun name (e.g. `FetchOrders`).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Executor type, resolved against the executor registry at load time.
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub execution: TaskExecution,
    /// Names of tasks that must finish first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Dependencies whose terminal failure still lets this task run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_on_failure_of: Vec<String>,
    /// Null-safe expression gating execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_condition: Option<String>,
    /// Mutually exclusive routing evaluated after this task completes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional_branches: Vec<ConditionalBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_approval: Option<ManualApproval>,
    /// Overrides the workflow default when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
    /// Diagram hint only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl TaskDefinition {
    /// Whether an enabled manual approval gate guards this task.
    pub fn requires_approval(&self) -> bool {
        self.manual_approval.as_ref().is_some_and(|a| a.enabled)
    }
}

/// What the executor adapter receives for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Static configuration; never varies per run and may not contain templates.
    #[serde(default, alias = "Specification", skip_serializing_if = "Value::is_null")]
    pub specification: Value,
    /// Runtime parameters; strings may contain `$[...]` templates.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_milliseconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// One routing option of a task's conditional branches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalBranch {
    /// Condition expression; `true` marks the default branch.
    pub expression: String,
    /// Task routed to when the expression holds.
    pub task_name: String,
}

/// Manual approval gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManualApproval {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvers: Vec<String>,
    /// An undecided approval is rejected once this elapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_milliseconds: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Diagram coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

/// Error handling policy for a task (or the workflow default).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorHandling {
    pub strategy: ErrorStrategy,
    /// Only valid with `Retry`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Only valid with `TriggerTask`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_policy: Option<TriggerPolicy>,
}

/// What happens when a task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ErrorStrategy {
    /// Stop dispatching, let in-flight tasks finish, fail the run.
    #[default]
    Abort,
    /// Re-attempt per the retry policy.
    Retry,
    /// Mark the task skipped; dependents proceed.
    Skip,
    /// Dispatch a compensating task.
    TriggerTask,
}

impl std::fmt::Display for ErrorStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Abort => "Abort",
            Self::Retry => "Retry",
            Self::Skip => "Skip",
            Self::TriggerTask => "TriggerTask",
        };
        f.write_str(s)
    }
}

/// Retry bound and backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt (0-10). 0 means a single attempt.
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Backoff base delay.
    #[serde(default = "default_delay_milliseconds")]
    pub delay_milliseconds: u64,
    /// Optional cap applied to every computed delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_milliseconds: Option<u64>,
}

fn default_delay_milliseconds() -> u64 {
    1000
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Linear,
    Exponential,
    /// Exponential delay randomized within `[0, computed]`.
    Jitter,
}

/// Compensation target for `TriggerTask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerPolicy {
    pub task_name: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
