//! Built-in task executors.
//!
//! Implements the [`TaskExecutor`] boundary from weaver-core for the task
//! types every `weaver run` understands without plugins:
//! - `Echo` returns its resolved parameters
//! - `Delay` sleeps for `parameters.durationMilliseconds`
//! - `Fail` fails with `parameters.message`
//!
//! The trait is defined in core; concrete executors live here, the same split
//! as `SqliteWorkflowRepository` implementing `WorkflowRepository`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use weaver_core::workflow::task_executor::{
    ExecutorRegistry, TaskError, TaskExecutor, TaskFuture, TaskRequest,
};

pub const ECHO: &str = "Echo";
pub const DELAY: &str = "Delay";
pub const FAIL: &str = "Fail";

/// Registry holding `Echo`, `Delay` and `Fail`.
pub fn builtin_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    register_builtins(&mut registry);
    registry
}

/// Add the built-in types to an existing registry, replacing same-named entries.
pub fn register_builtins(registry: &mut ExecutorRegistry) {
    registry.register(ECHO, Arc::new(EchoExecutor));
    registry.register(DELAY, Arc::new(DelayExecutor));
    registry.register(FAIL, Arc::new(FailExecutor));
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

pub struct EchoExecutor;

impl TaskExecutor for EchoExecutor {
    fn execute(&self, request: TaskRequest, _cancel: CancellationToken) -> TaskFuture<'_> {
        Box::pin(async move {
            tracing::debug!(task = %request.task_name, attempt = request.attempt, "echo");
            Ok(request.parameters)
        })
    }
}

// ---------------------------------------------------------------------------
// Delay
// ---------------------------------------------------------------------------

/// Waits, then returns `{ "sleptMilliseconds": n }`. Stops early on cancellation.
pub struct DelayExecutor;

impl TaskExecutor for DelayExecutor {
    fn execute(&self, request: TaskRequest, cancel: CancellationToken) -> TaskFuture<'_> {
        Box::pin(async move {
            let ms = request
                .parameters
                .get("durationMilliseconds")
                .and_then(Value::as_u64)
                .ok_or_else(|| {
                    TaskError::InvalidRequest(
                        "parameters.durationMilliseconds must be a non-negative integer"
                            .to_string(),
                    )
                })?;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                    Ok(json!({ "sleptMilliseconds": ms }))
                }
                _ = cancel.cancelled() => {
                    tracing::debug!(task = %request.task_name, "delay cancelled");
                    Err(TaskError::Cancelled)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Fail
// ---------------------------------------------------------------------------

pub struct FailExecutor;

impl TaskExecutor for FailExecutor {
    fn execute(&self, request: TaskRequest, _cancel: CancellationToken) -> TaskFuture<'_> {
        Box::pin(async move {
            let message = request
                .parameters
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("task failed")
                .to_string();
            Err(TaskError::Failed(message))
        })
    }
}
