use std::sync::Arc;

use tally_core::domain::query::GeneratedQuery;
use tally_core::domain::result_set::ResultSet;
use tally_core::errors::{ExecutionFailure, ExecutionFailureKind, PipelineError};
use tally_warehouse::Warehouse;
use tracing::{info, warn};

use crate::guardrails::{GuardrailDecision, GuardrailPolicy};

/// Runs a generated query behind the read-only guardrail. Statements run in
/// order and the last statement's rows are the result.
pub struct QueryExecutor {
    warehouse: Arc<dyn Warehouse>,
    guardrails: GuardrailPolicy,
}

impl QueryExecutor {
    pub fn new(warehouse: Arc<dyn Warehouse>, guardrails: GuardrailPolicy) -> Self {
        Self { warehouse, guardrails }
    }

    pub async fn execute(&self, query: &GeneratedQuery) -> Result<ResultSet, PipelineError> {
        let statements = match self.guardrails.evaluate(&query.sql) {
            GuardrailDecision::Allow { statements } => statements,
            GuardrailDecision::Deny { reason_code, user_message } => {
                warn!(event_name = "execution.guardrail_denied", reason_code, "refused query");
                let failure = ExecutionFailure::new(ExecutionFailureKind::Permission, user_message);
                return Err(failure.into());
            }
        };

        let mut result = ResultSet::default();
        for statement in &statements {
            result = self
                .warehouse
                .execute(statement)
                .await
                .map_err(tally_warehouse::WarehouseError::into_pipeline_error)?;
        }

        info!(
            event_name = "execution.completed",
            statements = statements.len(),
            rows = result.row_count(),
            validated = query.is_validated(),
            "query executed"
        );
        Ok(result)
    }
}
