//! Task executor boundary.
//!
//! The engine never knows what a task does. Each declared `type` maps to a
//! `TaskExecutor` registered in an `ExecutorRegistry`; the mapping is resolved
//! once when the plan is compiled, not on every dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an executor receives for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub execution_id: Uuid,
    pub task_name: String,
    pub task_type: String,
    pub operation: Option<String>,
    /// Static configuration, identical for every run.
    pub specification: Value,
    /// Parameters with templates already rendered.
    pub parameters: Value,
    pub agent: Option<String>,
    /// 1-based.
    pub attempt: u32,
    pub timeout: Duration,
}

/// Failure reported across the executor boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("task timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("task was cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TaskError {
    /// Cancellation is terminal; everything else feeds the error policy.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'a>>;

/// Performs the actual work of a task type.
///
/// Implementations should return promptly once `cancel` fires; the engine
/// waits only a short grace period before abandoning the call.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, request: TaskRequest, cancel: CancellationToken) -> TaskFuture<'_>;
}

/// Adapts an async closure into a `TaskExecutor`.
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(TaskRequest, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(TaskRequest, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    fn execute(&self, request: TaskRequest, cancel: CancellationToken) -> TaskFuture<'_> {
        Box::pin((self.f)(request, cancel))
    }
}

/// Task type name -> executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for `task_type`.
    pub fn register(&mut self, task_type: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(task_type.into(), executor);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("types", &self.types())
            .finish()
    }
}
