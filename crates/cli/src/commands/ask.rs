use std::sync::Arc;

use serde_json::Map;
use tally_agent::metadata::restrict_to_warehouse;
use tally_agent::{PipelineController, RunOutcome};
use tally_core::config::AppConfig;
use tally_core::domain::session::{Session, SessionId, SessionKey};
use tally_core::schema::SchemaCatalog;
use tally_db::repositories::{SessionRepository, SqlSessionRepository};
use tally_db::{connect_with_settings, migrations};
use tokio::sync::mpsc;

use crate::commands::{load_config, remote_clients, runtime, CommandResult, StepFailure};

#[derive(Debug, Clone)]
pub struct AskOptions {
    pub question: String,
    pub app_name: String,
    pub user_id: String,
    pub session_id: Option<String>,
}

/// Runs one question end to end. The output is one JSON object per pipeline
/// event; the exit code is 0 only when the run completed.
pub fn run(options: AskOptions) -> CommandResult {
    let config = match load_config("ask") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("ask") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    match runtime.block_on(ask(&config, options)) {
        Ok(result) => result,
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("ask", error_class, message, exit_code)
        }
    }
}

async fn ask(config: &AppConfig, options: AskOptions) -> Result<CommandResult, StepFailure> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), 5u8))?;

    let (warehouse, llm) = remote_clients(config)?;
    let mut catalog = SchemaCatalog::load_or_empty(&config.metadata.path)
        .map_err(|error| ("metadata", error.to_string(), 7u8))?;
    restrict_to_warehouse(warehouse.as_ref(), &mut catalog).await;
    let schema = catalog.render().map_err(|error| ("metadata", error.to_string(), 7u8))?;

    let sessions: Arc<dyn SessionRepository> = Arc::new(SqlSessionRepository::new(pool.clone()));
    let controller =
        PipelineController::assemble(&config.pipeline, llm, warehouse, sessions.clone(), schema)
            .map_err(|error| ("prompt_templates", error.to_string(), 8u8))?;

    let key = SessionKey::new(
        options.app_name,
        options.user_id,
        options.session_id.map(SessionId).unwrap_or_else(SessionId::generate),
    );
    let session = open_session(sessions.as_ref(), key).await?;

    let (sender, mut receiver) = mpsc::channel(32);
    let collect = async {
        let mut lines = Vec::new();
        while let Some(event) = receiver.recv().await {
            lines.push(serde_json::to_string(&event).unwrap_or_default());
        }
        lines
    };
    let (outcome, lines) =
        tokio::join!(controller.run(&session, &options.question, sender), collect);
    pool.close().await;

    let exit_code = match outcome {
        RunOutcome::Completed(_) => 0,
        RunOutcome::Failed(_) | RunOutcome::Cancelled => 1,
    };
    Ok(CommandResult { exit_code, output: lines.join("\n") })
}

async fn open_session(
    sessions: &dyn SessionRepository,
    key: SessionKey,
) -> Result<Session, StepFailure> {
    let existing =
        sessions.get(&key).await.map_err(|error| ("session_store", error.to_string(), 4u8))?;
    match existing {
        Some(session) => Ok(session),
        None => sessions
            .create(key, Map::new())
            .await
            .map_err(|error| ("session_store", error.to_string(), 4u8)),
    }
}
