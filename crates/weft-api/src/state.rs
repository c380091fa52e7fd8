//! Application state wiring the engine together.
//!
//! `AppState` pins the core's generics to the concrete SQLite
//! implementations and carries the shared pieces (event bus, registry,
//! config) used by every CLI command. Handlers registered here are the
//! built-in diagnostics; real integrations register through the library
//! API before `serve` is started.

use std::sync::Arc;
use std::time::Duration;

use weft_core::action::{ActionRegistry, EchoHandler, NoopHandler};
use weft_core::event::bus::EventBus;
use weft_infra::config::{database_url, load_engine_config};
use weft_infra::sqlite::broker::SqliteBroker;
use weft_infra::sqlite::execution::SqliteExecutionRepository;
use weft_infra::sqlite::integration::SqliteIntegrationRepository;
use weft_infra::sqlite::pool::DatabasePool;
use weft_infra::sqlite::workflow::SqliteWorkflowRepository;
use weft_types::config::EngineConfig;

/// Shared application state for CLI commands.
pub struct AppState {
    pub config: EngineConfig,
    pub workflows: Arc<SqliteWorkflowRepository>,
    pub executions: Arc<SqliteExecutionRepository>,
    pub integrations: Arc<SqliteIntegrationRepository>,
    pub broker: Arc<SqliteBroker>,
    pub registry: Arc<ActionRegistry>,
    pub events: EventBus,
}

impl AppState {
    /// Connect to the database, run migrations, and wire the services.
    pub async fn init() -> anyhow::Result<Self> {
        let config = load_engine_config();
        let url = database_url();

        ensure_parent_dir(&url)?;
        // Readers cover the step consumers plus the admission consumer and
        // the CLI inspection commands.
        let pool = DatabasePool::open(&url, config.step_consumers + 2).await?;
        tracing::debug!(database = url.as_str(), "database ready");

        let broker = Arc::new(SqliteBroker::new(
            pool.clone(),
            Duration::from_millis(config.lease_ms),
            config.delivery_limit,
        ));

        let mut registry = ActionRegistry::new();
        registry.register(NoopHandler);
        registry.register(EchoHandler);

        Ok(Self {
            workflows: Arc::new(SqliteWorkflowRepository::new(pool.clone())),
            executions: Arc::new(SqliteExecutionRepository::new(pool.clone())),
            integrations: Arc::new(SqliteIntegrationRepository::new(pool)),
            broker,
            registry: Arc::new(registry),
            events: EventBus::new(1024),
            config,
        })
    }
}

/// Create the data directory for a `sqlite://` URL if it does not exist.
fn ensure_parent_dir(database_url: &str) -> anyhow::Result<()> {
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        let path = path.split('?').next().unwrap_or(path);
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
