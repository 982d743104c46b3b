use std::sync::Arc;

use tally_core::schema::{ColumnMetadata, ExtraDescriptions, SchemaCatalog, TableMetadata};
use tally_warehouse::{Warehouse, WarehouseError};
use tracing::{info, warn};

use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use crate::prompts::Prompts;

const SAMPLE_SIZE: usize = 5;
const DESCRIPTION_TEMPERATURE: f32 = 0.1;
const DESCRIPTION_MAX_TOKENS: u32 = 100;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub tables: usize,
    pub columns: usize,
    pub from_extra: usize,
    pub from_previous: usize,
    pub generated: usize,
    pub undescribed: usize,
}

/// Rebuilds the schema catalog from the live warehouse. Column descriptions
/// come from the extra-descriptions file, then the previous catalog, then the
/// model.
pub struct MetadataRefresher {
    warehouse: Arc<dyn Warehouse>,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<Prompts>,
}

impl MetadataRefresher {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<Prompts>,
    ) -> Self {
        Self { warehouse, llm, prompts }
    }

    pub async fn refresh(
        &self,
        previous: &SchemaCatalog,
        extra: &ExtraDescriptions,
    ) -> Result<(SchemaCatalog, RefreshReport), WarehouseError> {
        let mut catalog = SchemaCatalog::default();
        let mut report = RefreshReport::default();

        for table in self.warehouse.list_tables().await? {
            let described = self.warehouse.describe_table(&table).await?;
            let previous_table = previous.table(&table);
            let mut metadata = TableMetadata {
                description: extra
                    .table(&table)
                    .or_else(|| previous.table_description(&table))
                    .unwrap_or_default()
                    .to_owned(),
                columns: Vec::with_capacity(described.len()),
                extra: previous_table.map(|known| known.extra.clone()).unwrap_or_default(),
            };

            for column in described {
                let known = previous_table.and_then(|known| known.column(&column.name));
                let description = if let Some(text) = extra.column(&table, &column.name) {
                    report.from_extra += 1;
                    text.to_owned()
                } else if let Some(text) = previous.column_description(&table, &column.name) {
                    report.from_previous += 1;
                    text.to_owned()
                } else {
                    let generated = self.describe(&table, &column.name, &column.data_type).await;
                    if generated.is_empty() {
                        report.undescribed += 1;
                    } else {
                        report.generated += 1;
                    }
                    generated
                };

                let mut entry = ColumnMetadata::new(&column.name, &column.data_type, description);
                if let Some(known) = known {
                    entry.possible_values = known.possible_values.clone();
                    entry.extra = known.extra.clone();
                }
                metadata.columns.push(entry);
                report.columns += 1;
            }

            info!(
                event_name = "metadata.table_refreshed",
                table = %table,
                columns = metadata.columns.len(),
                "table metadata refreshed"
            );
            catalog.insert(table, metadata);
            report.tables += 1;
        }

        Ok((catalog, report))
    }

    /// One sentence from the model, or empty text when sampling or the model fails.
    async fn describe(&self, table: &str, column: &str, data_type: &str) -> String {
        let samples = match self.warehouse.sample_column(table, column, SAMPLE_SIZE).await {
            Ok(samples) => samples,
            Err(error) => {
                warn!(
                    event_name = "metadata.sample_failed",
                    table,
                    column,
                    error = %error,
                    "sampling failed"
                );
                Vec::new()
            }
        };
        let prompt = match self.prompts.column_description(table, column, data_type, &samples) {
            Ok(prompt) => prompt,
            Err(error) => {
                warn!(
                    event_name = "metadata.prompt_failed",
                    error = %error,
                    "description prompt failed"
                );
                return String::new();
            }
        };

        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .temperature(DESCRIPTION_TEMPERATURE)
            .max_tokens(DESCRIPTION_MAX_TOKENS);
        match self.llm.complete(request).await {
            Ok(text) => text.trim().to_owned(),
            Err(error) => {
                warn!(
                    event_name = "metadata.describe_failed",
                    table,
                    column,
                    error = %error,
                    "description failed"
                );
                String::new()
            }
        }
    }
}

/// Drops catalog tables the warehouse does not report. When the warehouse
/// cannot be listed the catalog is kept whole.
pub async fn restrict_to_warehouse(warehouse: &dyn Warehouse, catalog: &mut SchemaCatalog) {
    match warehouse.list_tables().await {
        Ok(existing) => {
            let dropped = catalog.retain_tables(&existing);
            if !dropped.is_empty() {
                info!(
                    event_name = "metadata.tables_dropped",
                    dropped = ?dropped,
                    "metadata tables missing from the warehouse were dropped"
                );
            }
        }
        Err(error) => {
            warn!(
                event_name = "metadata.list_tables_failed",
                error = %error,
                "could not list warehouse tables; using metadata as recorded"
            );
        }
    }
}
