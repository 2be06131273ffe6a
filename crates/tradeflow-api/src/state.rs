//! Application state wiring all services together.
//!
//! The workflow service is generic over its repository; `AppState` pins it
//! to the SQLite implementation and the executor registry built from
//! `config.toml`.

use std::path::PathBuf;
use std::sync::Arc;

use tradeflow_core::event::EventBus;
use tradeflow_core::service::workflow::WorkflowService;
use tradeflow_core::workflow::engine::WorkflowEngine;
use tradeflow_infra::config::load_engine_config;
use tradeflow_infra::executor::default_registry;
use tradeflow_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use tradeflow_infra::sqlite::pool::{DatabasePool, database_url};
use tradeflow_infra::sqlite::workflow::SqliteWorkflowRepository;
use tradeflow_types::config::EngineConfig;

/// Concrete service type pinned to the infra implementations.
pub type ConcreteWorkflowService = WorkflowService<SqliteWorkflowRepository>;

/// Shared application state used by every CLI command.
pub struct AppState {
    pub workflow_service: Arc<ConcreteWorkflowService>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: load config, connect to DB, wire
    /// the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        ensure_data_dir(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;

        let repo = Arc::new(SqliteWorkflowRepository::new(db_pool.clone()));
        let registry = Arc::new(default_registry(&config, Some(&db_pool))?);
        let engine = Arc::new(WorkflowEngine::new(repo, registry, &config, EventBus::default()));
        let workflow_service = WorkflowService::new(engine, &config);

        tracing::debug!(
            data_dir = %data_dir.display(),
            max_workers = config.max_workers,
            "state initialized"
        );

        Ok(Self {
            workflow_service: Arc::new(workflow_service),
            config,
            data_dir,
        })
    }
}
