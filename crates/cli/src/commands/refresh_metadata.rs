use std::path::PathBuf;
use std::sync::Arc;

use tally_agent::metadata::MetadataRefresher;
use tally_agent::prompts::Prompts;
use tally_core::config::AppConfig;
use tally_core::schema::{ExtraDescriptions, SchemaCatalog};

use crate::commands::{load_config, remote_clients, runtime, CommandResult, StepFailure};

pub fn run(output: Option<PathBuf>) -> CommandResult {
    let config = match load_config("refresh-metadata") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("refresh-metadata") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let target = output.unwrap_or_else(|| config.metadata.path.clone());
    match runtime.block_on(refresh(&config, target)) {
        Ok(message) => CommandResult::success("refresh-metadata", message),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("refresh-metadata", error_class, message, exit_code)
        }
    }
}

async fn refresh(config: &AppConfig, target: PathBuf) -> Result<String, StepFailure> {
    let previous = SchemaCatalog::load_or_empty(&config.metadata.path)
        .map_err(|error| ("metadata", error.to_string(), 7u8))?;
    let extra = match &config.metadata.extra_descriptions_path {
        Some(path) => ExtraDescriptions::load(path)
            .map_err(|error| ("extra_descriptions", error.to_string(), 7u8))?,
        None => ExtraDescriptions::default(),
    };

    let (warehouse, llm) = remote_clients(config)?;
    let prompts = Prompts::new().map_err(|error| ("prompt_templates", error.to_string(), 8u8))?;
    let refresher = MetadataRefresher::new(warehouse, llm, Arc::new(prompts));

    let (catalog, report) = refresher
        .refresh(&previous, &extra)
        .await
        .map_err(|error| ("warehouse", error.to_string(), 4u8))?;
    catalog.save(&target).map_err(|error| ("metadata_write", error.to_string(), 5u8))?;

    Ok(format!(
        "wrote {} tables ({} columns) to `{}`: {} described from extra descriptions, \
         {} kept, {} generated, {} undescribed",
        report.tables,
        report.columns,
        target.display(),
        report.from_extra,
        report.from_previous,
        report.generated,
        report.undescribed
    ))
}
