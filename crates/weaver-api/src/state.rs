//! Application state shared by CLI commands.
//!
//! Resolves the data directory, loads `config.toml` and builds the executor
//! registry. The database is opened on demand so commands that never touch
//! persistence (validate, schema, `run --memory`) do not create it.

use std::path::PathBuf;

use anyhow::Context;
use weaver_core::workflow::task_executor::ExecutorRegistry;
use weaver_infra::config::{load_engine_config, resolve_database_url};
use weaver_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use weaver_infra::sqlite::pool::DatabasePool;
use weaver_infra::sqlite::workflow::SqliteWorkflowRepository;
use weaver_infra::workflow::builtin::builtin_registry;
use weaver_types::config::EngineConfig;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub registry: ExecutorRegistry,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        let config = load_engine_config(&data_dir).await;
        tracing::debug!(data_dir = %data_dir.display(), ?config, "engine configuration loaded");

        Ok(Self {
            data_dir,
            config,
            registry: builtin_registry(),
        })
    }

    /// Open (and migrate) the execution database.
    pub async fn open_repository(&self) -> anyhow::Result<SqliteWorkflowRepository> {
        ensure_data_dir(&self.data_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.data_dir.display()))?;

        let url = resolve_database_url(&self.config, &self.data_dir);
        let pool = DatabasePool::new(&url)
            .await
            .with_context(|| format!("Failed to open database at {url}"))?;
        Ok(SqliteWorkflowRepository::new(pool))
    }
}
