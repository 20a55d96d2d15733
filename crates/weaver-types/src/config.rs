//! Engine configuration types for Weaver.
//!
//! `EngineConfig` represents the top-level `config.toml` holding the engine
//! defaults a workflow definition may override.

use serde::{Deserialize, Serialize};

/// Engine-wide defaults and limits.
///
/// Loaded from `~/.weaver/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Used when a workflow does not set `degreeOfParallelism`.
    #[serde(default = "default_degree_of_parallelism")]
    pub default_degree_of_parallelism: u32,

    /// Used when a workflow does not set `timeoutMilliseconds`.
    #[serde(default = "default_workflow_timeout_ms")]
    pub default_workflow_timeout_ms: u64,

    /// Used when a task does not set `execution.timeoutMilliseconds`.
    #[serde(default = "default_task_timeout_ms")]
    pub default_task_timeout_ms: u64,

    /// Maximum dependency fan-in per task.
    #[serde(default = "default_max_dependencies")]
    pub max_dependencies: usize,

    /// Upper bound for `retryPolicy.maxRetries`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Task outputs larger than this are replaced by a truncation marker.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// SQLite URL; defaults to `{data_dir}/weaver.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_degree_of_parallelism() -> u32 {
    4
}

fn default_workflow_timeout_ms() -> u64 {
    1_800_000
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_max_dependencies() -> usize {
    10
}

fn default_max_retries() -> u32 {
    10
}

fn default_max_output_bytes() -> usize {
    1_048_576
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_degree_of_parallelism: default_degree_of_parallelism(),
            default_workflow_timeout_ms: default_workflow_timeout_ms(),
            default_task_timeout_ms: default_task_timeout_ms(),
            max_dependencies: default_max_dependencies(),
            max_retries: default_max_retries(),
            max_output_bytes: default_max_output_bytes(),
            database_url: None,
        }
    }
}
