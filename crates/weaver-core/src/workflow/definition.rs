//! Workflow definition loading and structural validation.
//!
//! Parses JSON or YAML documents into a `WorkflowDefinition` and enforces the
//! rules that need no graph analysis: naming, uniqueness, fan-in limits,
//! timeouts and branch shape. Graph-dependent rules run once the dependency
//! graph has been built (see `validate_graph_rules`).

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;
use weaver_types::config::EngineConfig;
use weaver_types::workflow::WorkflowDefinition;

use super::branch::is_default_expression;
use super::dag::DependencyGraph;
use super::expression::ExpressionError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while loading and validating a workflow.
///
/// None of these reach the scheduler: any of them aborts loading.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// JSON/YAML parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural or schema violation.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Invalid error-handling combination.
    #[error("policy error: {0}")]
    PolicyError(String),

    /// A task references a dependency that does not exist.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// Expression or template failed to compile or references an unknown name.
    #[error("expression error: {0}")]
    ExpressionError(String),

    /// No executor is registered for a declared task type.
    #[error("unknown task type '{task_type}' for task '{task}'")]
    UnknownTaskType { task: String, task_type: String },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WorkflowError {
    /// Wrap an expression error with the location it was found at.
    pub fn expression(location: impl std::fmt::Display, err: ExpressionError) -> Self {
        Self::ExpressionError(format!("{location}: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a JSON document into a `WorkflowDefinition`.
///
/// Only deserializes; validation happens in `plan::compile`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Parse a YAML document into a `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load a definition from disk, picking the format by extension.
///
/// `.yaml` and `.yml` are parsed as YAML, everything else as JSON.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

    let def = if is_yaml {
        parse_workflow_yaml(&content)?
    } else {
        parse_workflow_json(&content)?
    };
    tracing::debug!(path = %path.display(), workflow = %def.name, tasks = def.tasks.len(), "loaded workflow definition");
    Ok(def)
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// PascalCase verb-noun: `[A-Z][A-Za-z0-9]*` with at least two capitalised words.
pub fn is_valid_task_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_uppercase() {
        return false;
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return false;
    }
    name.chars().filter(|c| c.is_ascii_uppercase()).count() >= 2
}

/// Variable names are non-empty and contain only alphanumerics and underscores.
pub fn is_valid_variable_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Structural validation
// ---------------------------------------------------------------------------

/// Validate the rules that need no dependency graph.
///
/// Checks:
/// - Workflow name is non-empty and at least one task exists
/// - Task names are unique PascalCase verb-noun names
/// - Variable names are well formed
/// - `degreeOfParallelism` >= 1 and every declared timeout > 0
/// - No task lists more than `max_dependencies` dependencies, or one twice
/// - Branch targets exist, are not the owner, are not repeated, at most one default
/// - Workflow timeout covers the sum of declared task timeouts
pub fn validate_structure(
    def: &WorkflowDefinition,
    config: &EngineConfig,
) -> Result<(), WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.tasks.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one task".to_string(),
        ));
    }

    for name in def.variables.keys() {
        if !is_valid_variable_name(name) {
            return Err(WorkflowError::ValidationError(format!(
                "variable name '{name}' is invalid (only alphanumerics and underscores allowed)"
            )));
        }
    }

    let mut names = HashSet::new();
    for task in &def.tasks {
        if !is_valid_task_name(&task.name) {
            return Err(WorkflowError::ValidationError(format!(
                "task name '{}' must be PascalCase verb-noun (e.g. 'FetchOrders')",
                task.name
            )));
        }
        if !names.insert(task.name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate task name: '{}'",
                task.name
            )));
        }
    }

    if let Some(dop) = def.configuration.degree_of_parallelism
        && dop == 0
    {
        return Err(WorkflowError::ValidationError(
            "degreeOfParallelism must be at least 1".to_string(),
        ));
    }
    if def.configuration.timeout_milliseconds == Some(0) {
        return Err(WorkflowError::ValidationError(
            "workflow timeoutMilliseconds must be greater than 0".to_string(),
        ));
    }

    let mut declared_total: u64 = 0;
    for task in &def.tasks {
        if task.dependencies.len() > config.max_dependencies {
            return Err(WorkflowError::ValidationError(format!(
                "task '{}' has {} dependencies (max {})",
                task.name,
                task.dependencies.len(),
                config.max_dependencies
            )));
        }
        let mut seen = HashSet::new();
        for dep in &task.dependencies {
            if !seen.insert(dep.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "task '{}' lists dependency '{}' more than once",
                    task.name, dep
                )));
            }
        }

        if let Some(timeout) = task.execution.timeout_milliseconds {
            if timeout == 0 {
                return Err(WorkflowError::ValidationError(format!(
                    "task '{}' timeoutMilliseconds must be greater than 0",
                    task.name
                )));
            }
            declared_total = declared_total.saturating_add(timeout);
        }
        if let Some(approval) = &task.manual_approval
            && approval.timeout_milliseconds == Some(0)
        {
            return Err(WorkflowError::ValidationError(format!(
                "task '{}' approval timeoutMilliseconds must be greater than 0",
                task.name
            )));
        }

        validate_branches(task, &names)?;
    }

    let workflow_timeout = def
        .configuration
        .timeout_milliseconds
        .unwrap_or(config.default_workflow_timeout_ms);
    if declared_total > workflow_timeout {
        return Err(WorkflowError::ValidationError(format!(
            "workflow timeout {workflow_timeout}ms is less than the sum of task timeouts ({declared_total}ms)"
        )));
    }

    Ok(())
}

fn validate_branches(
    task: &weaver_types::workflow::TaskDefinition,
    names: &HashSet<&str>,
) -> Result<(), WorkflowError> {
    let mut targets = HashSet::new();
    let mut defaults = 0;
    for branch in &task.conditional_branches {
        if branch.task_name == task.name {
            return Err(WorkflowError::ValidationError(format!(
                "task '{}' has a conditional branch targeting itself",
                task.name
            )));
        }
        if !names.contains(branch.task_name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "task '{}' branches to unknown task '{}'",
                task.name, branch.task_name
            )));
        }
        if !targets.insert(branch.task_name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "task '{}' targets '{}' from more than one branch",
                task.name, branch.task_name
            )));
        }
        if is_default_expression(&branch.expression) {
            defaults += 1;
        }
    }
    if defaults > 1 {
        return Err(WorkflowError::ValidationError(format!(
            "task '{}' declares {defaults} default branches (at most one allowed)",
            task.name
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Graph-dependent rules
// ---------------------------------------------------------------------------

/// Rules that need the dependency graph.
///
/// - `runOnFailureOf` names only direct or transitive dependencies
/// - every enabled approval gate has at least one dependent
pub fn validate_graph_rules(
    def: &WorkflowDefinition,
    graph: &DependencyGraph,
) -> Result<(), WorkflowError> {
    for (idx, task) in def.tasks.iter().enumerate() {
        if !task.run_on_failure_of.is_empty() {
            let ancestors = graph.ancestors(idx);
            for name in &task.run_on_failure_of {
                let is_upstream = graph
                    .index_of(name)
                    .is_some_and(|i| ancestors.contains(&i));
                if !is_upstream {
                    return Err(WorkflowError::ValidationError(format!(
                        "task '{}' lists '{}' in runOnFailureOf but does not depend on it",
                        task.name, name
                    )));
                }
            }
        }

        if task.requires_approval() && graph.downstream(idx).is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "task '{}' requires manual approval but no task depends on it",
                task.name
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn definition(value: serde_json::Value) -> WorkflowDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn two_task() -> serde_json::Value {
        json!({
            "name": "Pipeline",
            "tasks": [
                { "name": "FetchOrders", "type": "Echo" },
                { "name": "ShipOrders", "type": "Echo", "dependencies": ["FetchOrders"] }
            ]
        })
    }

    fn assert_validation(def: &WorkflowDefinition, fragment: &str) {
        let err = validate_structure(def, &EngineConfig::default()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains(fragment), "expected '{fragment}' in '{text}'");
    }

    #[test]
    fn test_task_name_rules() {
        assert!(is_valid_task_name("FetchOrders"));
        assert!(is_valid_task_name("SendV2Report"));
        assert!(!is_valid_task_name("Fetch"));
        assert!(!is_valid_task_name("fetchOrders"));
        assert!(!is_valid_task_name("fetch_orders"));
        assert!(!is_valid_task_name("Fetch_Orders"));
        assert!(!is_valid_task_name(""));
    }

    #[test]
    fn test_valid_structure_passes() {
        let def = definition(two_task());
        validate_structure(&def, &EngineConfig::default()).unwrap();
    }

    #[test]
    fn test_duplicate_task_name_rejected() {
        let def = definition(json!({
            "name": "Pipeline",
            "tasks": [
                { "name": "FetchOrders", "type": "Echo" },
                { "name": "FetchOrders", "type": "Echo" }
            ]
        }));
        assert_validation(&def, "duplicate task name");
    }

    #[test]
    fn test_empty_tasks_rejected() {
        let def = definition(json!({ "name": "Pipeline", "tasks": [] }));
        assert_validation(&def, "at least one task");
    }

    #[test]
    fn test_fan_in_limit() {
        let mut tasks: Vec<serde_json::Value> = (0..11)
            .map(|i| json!({ "name": format!("LoadPart{i}"), "type": "Echo" }))
            .collect();
        let deps: Vec<String> = (0..11).map(|i| format!("LoadPart{i}")).collect();
        tasks.push(json!({ "name": "MergeParts", "type": "Echo", "dependencies": deps }));
        let def = definition(json!({ "name": "Fan", "tasks": tasks }));
        assert_validation(&def, "11 dependencies (max 10)");
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut value = two_task();
        value["configuration"] = json!({ "degreeOfParallelism": 0 });
        assert_validation(&definition(value), "degreeOfParallelism");
    }

    #[test]
    fn test_timeout_sum_exceeds_workflow_timeout() {
        let def = definition(json!({
            "name": "Pipeline",
            "configuration": { "timeoutMilliseconds": 1000 },
            "tasks": [
                { "name": "FetchOrders", "type": "Echo", "execution": { "timeoutMilliseconds": 600 } },
                { "name": "ShipOrders", "type": "Echo", "execution": { "timeoutMilliseconds": 600 } }
            ]
        }));
        assert_validation(&def, "sum of task timeouts");
    }

    #[test]
    fn test_branch_rules() {
        let self_target = definition(json!({
            "name": "Pipeline",
            "tasks": [
                { "name": "CheckStock", "type": "Echo",
                  "conditionalBranches": [{ "expression": "true", "taskName": "CheckStock" }] }
            ]
        }));
        assert_validation(&self_target, "targeting itself");

        let unknown = definition(json!({
            "name": "Pipeline",
            "tasks": [
                { "name": "CheckStock", "type": "Echo",
                  "conditionalBranches": [{ "expression": "true", "taskName": "OrderMore" }] }
            ]
        }));
        assert_validation(&unknown, "unknown task 'OrderMore'");

        let two_defaults = definition(json!({
            "name": "Pipeline",
            "tasks": [
                { "name": "CheckStock", "type": "Echo",
                  "conditionalBranches": [
                      { "expression": "true", "taskName": "OrderMore" },
                      { "expression": "$[true]", "taskName": "ReportStock" }
                  ] },
                { "name": "OrderMore", "type": "Echo" },
                { "name": "ReportStock", "type": "Echo" }
            ]
        }));
        assert_validation(&two_defaults, "default branches");
    }

    #[test]
    fn test_run_on_failure_must_be_upstream() {
        let def = definition(json!({
            "name": "Pipeline",
            "tasks": [
                { "name": "FetchOrders", "type": "Echo" },
                { "name": "CleanUp", "type": "Echo" },
                { "name": "ShipOrders", "type": "Echo",
                  "dependencies": ["FetchOrders"], "runOnFailureOf": ["CleanUp"] }
            ]
        }));
        let graph = DependencyGraph::build(&def.tasks);
        let err = validate_graph_rules(&def, &graph).unwrap_err();
        assert!(err.to_string().contains("runOnFailureOf"));
    }

    #[test]
    fn test_approval_without_dependents_rejected() {
        let def = definition(json!({
            "name": "Pipeline",
            "tasks": [
                { "name": "ReviewOrder", "type": "Echo", "manualApproval": { "enabled": true } }
            ]
        }));
        let graph = DependencyGraph::build(&def.tasks);
        let err = validate_graph_rules(&def, &graph).unwrap_err();
        assert!(err.to_string().contains("manual approval"));
    }

    #[test]
    fn test_load_workflow_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("pipeline.json");
        std::fs::write(&json_path, two_task().to_string()).unwrap();
        assert_eq!(load_workflow_file(&json_path).unwrap().tasks.len(), 2);

        let yaml_path = dir.path().join("pipeline.yml");
        let mut file = std::fs::File::create(&yaml_path).unwrap();
        writeln!(file, "name: Nightly\ntasks:\n  - name: CleanCache\n    type: Echo").unwrap();
        assert_eq!(load_workflow_file(&yaml_path).unwrap().name, "Nightly");

        let missing = load_workflow_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, WorkflowError::IoError(_)));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = parse_workflow_json("{ not json").unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }
}
