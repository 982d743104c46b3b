use std::sync::Arc;

use tally_agent::llm::{LlmClient, LlmError, OpenAiCompatibleClient};
use tally_agent::metadata::restrict_to_warehouse;
use tally_agent::prompts::PromptError;
use tally_agent::PipelineController;
use tally_core::config::{AppConfig, ConfigError, LoadOptions};
use tally_core::schema::{SchemaCatalog, SchemaError};
use tally_db::repositories::{SessionRepository, SqlSessionRepository};
use tally_db::{connect_with_settings, migrations, DbPool};
use tally_warehouse::{PrestoClient, Warehouse, WarehouseError};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub controller: Arc<PipelineController>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("warehouse client could not be built: {0}")]
    Warehouse(#[source] WarehouseError),
    #[error("model client could not be built: {0}")]
    Llm(#[source] LlmError),
    #[error("metadata could not be loaded: {0}")]
    Schema(#[from] SchemaError),
    #[error("prompt templates are invalid: {0}")]
    Prompt(#[from] PromptError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "session database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let warehouse: Arc<dyn Warehouse> =
        Arc::new(PrestoClient::from_config(&config.warehouse).map_err(BootstrapError::Warehouse)?);
    let llm: Arc<dyn LlmClient> =
        Arc::new(OpenAiCompatibleClient::from_config(&config.llm).map_err(BootstrapError::Llm)?);

    let mut catalog = SchemaCatalog::load_or_empty(&config.metadata.path)?;
    restrict_to_warehouse(warehouse.as_ref(), &mut catalog).await;
    info!(
        event_name = "system.bootstrap.metadata_loaded",
        correlation_id = "bootstrap",
        tables = catalog.len(),
        path = %config.metadata.path.display(),
        "schema metadata loaded"
    );

    let sessions: Arc<dyn SessionRepository> =
        Arc::new(SqlSessionRepository::new(db_pool.clone()));
    let controller = PipelineController::assemble(
        &config.pipeline,
        llm,
        warehouse,
        sessions,
        catalog.render()?,
    )?;

    Ok(Application { config, db_pool, controller: Arc::new(controller) })
}
