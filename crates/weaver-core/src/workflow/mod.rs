//! Workflow engine core: definition loading, plan compilation and DAG execution.
//!
//! - `definition` -- JSON/YAML parsing and structural validation
//! - `dag` -- dependency graph, cycle detection, topological order
//! - `policy` -- error-policy resolution and checks
//! - `retry` -- retry bound and backoff delays
//! - `expression` -- `$[...]` templates and the condition language
//! - `branch` -- conditional-branch selection
//! - `approval` -- manual approval gate and signal handle
//! - `context` -- run-scoped variables and published results
//! - `state` -- per-task state machine
//! - `task_executor` -- the executor boundary and registry
//! - `plan` -- load-time compilation into an executable plan
//! - `executor` -- bounded-parallel scheduler

pub mod approval;
pub mod branch;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod expression;
pub mod plan;
pub mod policy;
pub mod retry;
pub mod state;
pub mod task_executor;
