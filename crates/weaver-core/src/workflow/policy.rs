//! Error-policy resolution.
//!
//! A task-level `errorHandling` block fully replaces the workflow default for
//! that task; there is no field-wise merge. With neither present the task
//! aborts the run on failure.

use weaver_types::config::EngineConfig;
use weaver_types::workflow::{ErrorHandling, ErrorStrategy, RetryPolicy, TaskDefinition};

use super::dag::DependencyGraph;
use super::definition::WorkflowError;

/// Effective failure behaviour of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedPolicy {
    Abort,
    Retry(RetryPolicy),
    Skip,
    /// Dispatch the named compensation task on terminal failure.
    TriggerTask(String),
}

impl ResolvedPolicy {
    pub fn strategy(&self) -> ErrorStrategy {
        match self {
            Self::Abort => ErrorStrategy::Abort,
            Self::Retry(_) => ErrorStrategy::Retry,
            Self::Skip => ErrorStrategy::Skip,
            Self::TriggerTask(_) => ErrorStrategy::TriggerTask,
        }
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        match self {
            Self::Retry(policy) => Some(policy),
            _ => None,
        }
    }

    pub fn trigger_target(&self) -> Option<&str> {
        match self {
            Self::TriggerTask(target) => Some(target),
            _ => None,
        }
    }
}

/// Pick the handling block that applies: the task's own, else the default.
pub fn resolve<'a>(
    workflow_default: Option<&'a ErrorHandling>,
    task_override: Option<&'a ErrorHandling>,
) -> Option<&'a ErrorHandling> {
    task_override.or(workflow_default)
}

/// Validate field combinations and convert to a `ResolvedPolicy`.
///
/// `location` names the block in error messages.
pub fn check_handling(
    handling: Option<&ErrorHandling>,
    config: &EngineConfig,
    location: &str,
) -> Result<ResolvedPolicy, WorkflowError> {
    let Some(handling) = handling else {
        return Ok(ResolvedPolicy::Abort);
    };

    if handling.retry_policy.is_some() && handling.strategy != ErrorStrategy::Retry {
        return Err(WorkflowError::PolicyError(format!(
            "{location}: retryPolicy is only allowed with strategy Retry (found {})",
            handling.strategy
        )));
    }
    if handling.trigger_policy.is_some() && handling.strategy != ErrorStrategy::TriggerTask {
        return Err(WorkflowError::PolicyError(format!(
            "{location}: triggerPolicy is only allowed with strategy TriggerTask (found {})",
            handling.strategy
        )));
    }

    match handling.strategy {
        ErrorStrategy::Abort => Ok(ResolvedPolicy::Abort),
        ErrorStrategy::Skip => Ok(ResolvedPolicy::Skip),
        ErrorStrategy::Retry => {
            let policy = handling.retry_policy.clone().ok_or_else(|| {
                WorkflowError::PolicyError(format!(
                    "{location}: strategy Retry requires a retryPolicy"
                ))
            })?;
            if policy.max_retries > config.max_retries {
                return Err(WorkflowError::PolicyError(format!(
                    "{location}: maxRetries {} exceeds the maximum of {}",
                    policy.max_retries, config.max_retries
                )));
            }
            if policy.max_delay_milliseconds == Some(0) {
                return Err(WorkflowError::PolicyError(format!(
                    "{location}: maxDelayMilliseconds must be greater than 0"
                )));
            }
            Ok(ResolvedPolicy::Retry(policy))
        }
        ErrorStrategy::TriggerTask => {
            let trigger = handling.trigger_policy.as_ref().ok_or_else(|| {
                WorkflowError::PolicyError(format!(
                    "{location}: strategy TriggerTask requires a triggerPolicy"
                ))
            })?;
            if trigger.task_name.trim().is_empty() {
                return Err(WorkflowError::PolicyError(format!(
                    "{location}: triggerPolicy.taskName must not be empty"
                )));
            }
            Ok(ResolvedPolicy::TriggerTask(trigger.task_name.clone()))
        }
    }
}

/// Resolve and validate the effective policy of the task at `idx`.
///
/// Beyond the shape checks: Retry requires a positive declared task timeout,
/// and a trigger target must exist, differ from the task and not be one of
/// its ancestors (the compensation edge would close a cycle).
pub fn resolve_task_policy(
    task: &TaskDefinition,
    idx: usize,
    workflow_default: Option<&ErrorHandling>,
    graph: &DependencyGraph,
    config: &EngineConfig,
) -> Result<ResolvedPolicy, WorkflowError> {
    let location = format!("task '{}'", task.name);
    let policy = check_handling(
        resolve(workflow_default, task.error_handling.as_ref()),
        config,
        &location,
    )?;

    match &policy {
        ResolvedPolicy::Retry(_) => {
            if !task.execution.timeout_milliseconds.is_some_and(|t| t > 0) {
                return Err(WorkflowError::PolicyError(format!(
                    "{location}: strategy Retry requires execution.timeoutMilliseconds > 0"
                )));
            }
        }
        ResolvedPolicy::TriggerTask(target) => {
            let Some(target_idx) = graph.index_of(target) else {
                return Err(WorkflowError::PolicyError(format!(
                    "{location}: trigger task '{target}' does not exist"
                )));
            };
            if target_idx == idx {
                return Err(WorkflowError::PolicyError(format!(
                    "{location}: a task cannot trigger itself"
                )));
            }
            if graph.ancestors(idx).contains(&target_idx) {
                return Err(WorkflowError::PolicyError(format!(
                    "{location}: trigger task '{target}' is upstream and would form a cycle"
                )));
            }
        }
        ResolvedPolicy::Abort | ResolvedPolicy::Skip => {}
    }

    Ok(policy)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weaver_types::workflow::WorkflowDefinition;

    fn handling(value: serde_json::Value) -> ErrorHandling {
        serde_json::from_value(value).unwrap()
    }

    fn resolve_in(def: serde_json::Value, task: &str) -> Result<ResolvedPolicy, WorkflowError> {
        let def: WorkflowDefinition = serde_json::from_value(def).unwrap();
        let graph = DependencyGraph::build(&def.tasks);
        let idx = graph.index_of(task).unwrap();
        resolve_task_policy(
            &def.tasks[idx],
            idx,
            def.configuration.error_handling.as_ref(),
            &graph,
            &EngineConfig::default(),
        )
    }

    #[test]
    fn test_task_override_replaces_default() {
        let default = handling(json!({ "strategy": "Skip" }));
        let task = handling(json!({ "strategy": "Abort" }));
        assert_eq!(resolve(Some(&default), Some(&task)), Some(&task));
        assert_eq!(resolve(Some(&default), None), Some(&default));
        assert_eq!(resolve(None, None), None);
    }

    #[test]
    fn test_missing_handling_means_abort() {
        let policy = check_handling(None, &EngineConfig::default(), "task").unwrap();
        assert_eq!(policy, ResolvedPolicy::Abort);
    }

    #[test]
    fn test_retry_policy_only_with_retry() {
        let h = handling(json!({
            "strategy": "Skip",
            "retryPolicy": { "maxRetries": 2 }
        }));
        let err = check_handling(Some(&h), &EngineConfig::default(), "task 'X'").unwrap_err();
        assert!(matches!(err, WorkflowError::PolicyError(_)));
        assert!(err.to_string().contains("retryPolicy"));
    }

    #[test]
    fn test_trigger_policy_only_with_trigger() {
        let h = handling(json!({
            "strategy": "Retry",
            "retryPolicy": { "maxRetries": 1 },
            "triggerPolicy": { "taskName": "NotifyOps" }
        }));
        let err = check_handling(Some(&h), &EngineConfig::default(), "task").unwrap_err();
        assert!(err.to_string().contains("triggerPolicy"));
    }

    #[test]
    fn test_max_retries_bound() {
        let h = handling(json!({ "strategy": "Retry", "retryPolicy": { "maxRetries": 11 } }));
        let err = check_handling(Some(&h), &EngineConfig::default(), "task").unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum of 10"));
    }

    #[test]
    fn test_retry_requires_task_timeout() {
        let def = json!({
            "name": "Pipeline",
            "tasks": [{
                "name": "FetchOrders", "type": "Echo",
                "errorHandling": { "strategy": "Retry", "retryPolicy": { "maxRetries": 2 } }
            }]
        });
        let err = resolve_in(def, "FetchOrders").unwrap_err();
        assert!(err.to_string().contains("timeoutMilliseconds"));
    }

    #[test]
    fn test_retry_with_timeout_resolves() {
        let def = json!({
            "name": "Pipeline",
            "tasks": [{
                "name": "FetchOrders", "type": "Echo",
                "execution": { "timeoutMilliseconds": 5000 },
                "errorHandling": { "strategy": "Retry", "retryPolicy": { "maxRetries": 2 } }
            }]
        });
        let policy = resolve_in(def, "FetchOrders").unwrap();
        assert_eq!(policy.retry_policy().unwrap().max_retries, 2);
    }

    #[test]
    fn test_trigger_target_rules() {
        let missing = json!({
            "name": "Pipeline",
            "tasks": [{
                "name": "FetchOrders", "type": "Echo",
                "errorHandling": { "strategy": "TriggerTask", "triggerPolicy": { "taskName": "NotifyOps" } }
            }]
        });
        assert!(resolve_in(missing, "FetchOrders").unwrap_err().to_string().contains("does not exist"));

        let upstream = json!({
            "name": "Pipeline",
            "tasks": [
                { "name": "NotifyOps", "type": "Echo" },
                { "name": "FetchOrders", "type": "Echo", "dependencies": ["NotifyOps"],
                  "errorHandling": { "strategy": "TriggerTask", "triggerPolicy": { "taskName": "NotifyOps" } } }
            ]
        });
        assert!(resolve_in(upstream, "FetchOrders").unwrap_err().to_string().contains("cycle"));

        let valid = json!({
            "name": "Pipeline",
            "tasks": [
                { "name": "FetchOrders", "type": "Echo",
                  "errorHandling": { "strategy": "TriggerTask", "triggerPolicy": { "taskName": "NotifyOps" } } },
                { "name": "NotifyOps", "type": "Echo" }
            ]
        });
        assert_eq!(
            resolve_in(valid, "FetchOrders").unwrap(),
            ResolvedPolicy::TriggerTask("NotifyOps".to_string())
        );
    }

    #[test]
    fn test_default_trigger_cannot_target_itself() {
        let def = json!({
            "name": "Pipeline",
            "configuration": {
                "errorHandling": { "strategy": "TriggerTask", "triggerPolicy": { "taskName": "NotifyOps" } }
            },
            "tasks": [
                { "name": "FetchOrders", "type": "Echo" },
                { "name": "NotifyOps", "type": "Echo" }
            ]
        });
        assert!(resolve_in(def.clone(), "FetchOrders").is_ok());
        assert!(resolve_in(def, "NotifyOps").unwrap_err().to_string().contains("itself"));
    }
}
