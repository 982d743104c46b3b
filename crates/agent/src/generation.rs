use std::sync::Arc;

use tally_core::domain::query::{extract_sql, GeneratedQuery};
use tally_core::domain::question::Question;
use tally_core::errors::{ExecutionFailureKind, PipelineError};
use tally_warehouse::{Warehouse, WarehouseError};
use tracing::{debug, info, warn};

use crate::conversation::ConversationContext;
use crate::guardrails::split_statements;
use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use crate::prompts::Prompts;

const PLAN_TEMPERATURE: f32 = 0.2;
const GENERATION_TEMPERATURE: f32 = 0.1;
const CORRECTION_TEMPERATURE: f32 = 0.0;
const MAX_TOKENS: u32 = 4096;

/// Writes Presto SQL for a question and checks it with `EXPLAIN`, asking the
/// model to repair it while attempts remain.
pub struct QueryGenerator {
    llm: Arc<dyn LlmClient>,
    warehouse: Arc<dyn Warehouse>,
    prompts: Arc<Prompts>,
    schema: String,
    max_fix_attempts: u32,
    analysis_plan: bool,
}

impl QueryGenerator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        warehouse: Arc<dyn Warehouse>,
        prompts: Arc<Prompts>,
        schema: impl Into<String>,
        max_fix_attempts: u32,
    ) -> Self {
        Self {
            llm,
            warehouse,
            prompts,
            schema: schema.into(),
            max_fix_attempts: max_fix_attempts.max(1),
            analysis_plan: false,
        }
    }

    /// Drafts from an analyst's plan of the question when enabled.
    pub fn with_analysis_plan(mut self, enabled: bool) -> Self {
        self.analysis_plan = enabled;
        self
    }

    pub async fn generate(
        &self,
        question: &Question,
        context: &ConversationContext,
    ) -> Result<GeneratedQuery, PipelineError> {
        let plan = if self.analysis_plan { self.plan(question).await } else { None };
        let mut sql = self.draft(question, context, plan.as_deref()).await?;
        let mut last_error = String::new();

        for attempt in 1..=self.max_fix_attempts {
            match self.validate(&sql).await {
                Ok(()) => {
                    info!(event_name = "generation.validated", attempt, "query passed EXPLAIN");
                    return Ok(GeneratedQuery::validated(sql));
                }
                // An unreachable coordinator cannot judge the query.
                Err(error) if error.failure_kind().is_none() => {
                    return Err(error.into_pipeline_error());
                }
                Err(error) => {
                    last_error = error.to_string();
                    warn!(
                        event_name = "generation.validation_failed",
                        attempt,
                        max_attempts = self.max_fix_attempts,
                        error = %last_error,
                        "query failed EXPLAIN"
                    );
                    if attempt < self.max_fix_attempts {
                        sql = self.correct(&sql, &last_error).await?;
                    }
                }
            }
        }

        warn!(event_name = "generation.unvalidated", "handing unvalidated query to execution");
        Ok(GeneratedQuery::unvalidated(sql, last_error))
    }

    /// The coordinator plans one statement at a time, without a terminator.
    async fn validate(&self, sql: &str) -> Result<(), WarehouseError> {
        let statements = split_statements(sql);
        if statements.is_empty() {
            return Err(WarehouseError::Query {
                kind: ExecutionFailureKind::Syntax,
                message: "query contains no SQL statement".to_owned(),
                error_name: None,
            });
        }
        for statement in &statements {
            self.warehouse.validate(statement).await?;
        }
        Ok(())
    }

    /// A missing plan only weakens the draft, so failures are logged and dropped.
    async fn plan(&self, question: &Question) -> Option<String> {
        let system = match self.prompts.analysis_plan_system() {
            Ok(system) => system,
            Err(error) => {
                warn!(
                    event_name = "generation.plan_failed",
                    error = %error,
                    "analysis plan prompt failed"
                );
                return None;
            }
        };
        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(question.as_str()),
        ])
        .temperature(PLAN_TEMPERATURE)
        .max_tokens(MAX_TOKENS);

        match self.llm.complete(request).await {
            Ok(plan) if !plan.trim().is_empty() => {
                debug!(
                    event_name = "generation.planned",
                    chars = plan.len(),
                    "model produced analysis plan"
                );
                Some(plan)
            }
            Ok(_) => {
                warn!(
                    event_name = "generation.plan_failed",
                    error = "empty plan",
                    "drafting without a plan"
                );
                None
            }
            Err(error) => {
                warn!(
                    event_name = "generation.plan_failed",
                    error = %error,
                    "drafting without a plan"
                );
                None
            }
        }
    }

    async fn draft(
        &self,
        question: &Question,
        context: &ConversationContext,
        plan: Option<&str>,
    ) -> Result<String, PipelineError> {
        let system = self.prompts.generation_system().map_err(prompt_failure)?;
        let user = self
            .prompts
            .generation(
                question.as_str(),
                self.warehouse.catalog(),
                self.warehouse.database(),
                &self.schema,
                context.turns(),
                plan,
            )
            .map_err(prompt_failure)?;

        let request =
            CompletionRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
                .temperature(GENERATION_TEMPERATURE)
                .max_tokens(MAX_TOKENS);
        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|error| error.into_pipeline_error(PipelineError::Generation))?;

        let sql = extract_sql(&response);
        if sql.is_empty() {
            return Err(PipelineError::Generation("model response contained no SQL".to_owned()));
        }
        debug!(event_name = "generation.drafted", sql = %sql, "model drafted query");
        Ok(sql)
    }

    /// Keeps the previous candidate when the model answers without SQL.
    async fn correct(&self, sql: &str, error: &str) -> Result<String, PipelineError> {
        let system = self
            .prompts
            .correction_system(self.warehouse.catalog(), self.warehouse.database(), &self.schema)
            .map_err(prompt_failure)?;
        let user = self.prompts.correction(sql, error).map_err(prompt_failure)?;

        let request =
            CompletionRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
                .temperature(CORRECTION_TEMPERATURE)
                .max_tokens(MAX_TOKENS);
        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|error| error.into_pipeline_error(PipelineError::Generation))?;

        let corrected = extract_sql(&response);
        Ok(if corrected.is_empty() { sql.to_owned() } else { corrected })
    }
}

fn prompt_failure(error: crate::prompts::PromptError) -> PipelineError {
    PipelineError::Generation(error.to_string())
}
