use std::sync::Arc;

use tally_core::chart::{ChartError, ChartSpec};
use tally_core::domain::answer::Answer;
use tally_core::domain::query::GeneratedQuery;
use tally_core::domain::question::Question;
use tally_core::domain::result_set::ResultSet;
use tally_core::errors::PipelineError;
use tracing::{info, warn};

use crate::llm::{ChatMessage, CompletionRequest, LlmClient};
use crate::prompts::{Prompts, ResultPreview};

const SUMMARY_TEMPERATURE: f32 = 0.1;
const CHART_TEMPERATURE: f32 = 0.1;
const CHART_MAX_TOKENS: u32 = 8192;

/// Turns a result set into a narrative answer plus an optional Vega-Lite chart.
/// The chart is best effort: failing to draw one never fails the answer.
pub struct Summarizer {
    llm: Arc<dyn LlmClient>,
    prompts: Arc<Prompts>,
    max_result_rows: usize,
    max_chart_attempts: u32,
}

impl Summarizer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: Arc<Prompts>,
        max_result_rows: usize,
        max_chart_attempts: u32,
    ) -> Self {
        Self { llm, prompts, max_result_rows: max_result_rows.max(1), max_chart_attempts }
    }

    pub async fn summarize(
        &self,
        question: &Question,
        query: &GeneratedQuery,
        result: &ResultSet,
    ) -> Result<Answer, PipelineError> {
        let csv = result
            .to_csv(self.max_result_rows)
            .map_err(|error| PipelineError::Summarization(error.to_string()))?;
        let shown = result.row_count().min(self.max_result_rows);
        let preview = ResultPreview {
            question: question.as_str(),
            sql: &query.sql,
            columns: describe_columns(result),
            csv,
            shown,
            row_count: result.row_count(),
            truncated: result.row_count() > shown,
        };

        let (text, chart) = tokio::join!(self.narrate(&preview), self.draw_chart(&preview, result));
        Ok(Answer::new(text?, chart))
    }

    async fn narrate(&self, preview: &ResultPreview<'_>) -> Result<String, PipelineError> {
        let prompt = self
            .prompts
            .summary(preview)
            .map_err(|error| PipelineError::Summarization(error.to_string()))?;
        let response = self
            .llm
            .complete(
                CompletionRequest::new(vec![ChatMessage::user(prompt)])
                    .temperature(SUMMARY_TEMPERATURE),
            )
            .await
            .map_err(|error| error.into_pipeline_error(PipelineError::Summarization))?;

        let text = response.trim();
        if text.is_empty() {
            return Err(PipelineError::Summarization("model returned an empty answer".to_owned()));
        }
        Ok(text.to_owned())
    }

    async fn draw_chart(
        &self,
        preview: &ResultPreview<'_>,
        result: &ResultSet,
    ) -> Option<ChartSpec> {
        if result.is_empty() || self.max_chart_attempts == 0 {
            return None;
        }
        let prompt = match self.prompts.chart(preview) {
            Ok(prompt) => prompt,
            Err(error) => {
                warn!(
                    event_name = "summarize.chart_skipped",
                    error = %error,
                    "chart prompt failed"
                );
                return None;
            }
        };

        let mut messages = vec![ChatMessage::user(prompt)];
        for attempt in 1..=self.max_chart_attempts {
            let request = CompletionRequest::new(messages.clone())
                .temperature(CHART_TEMPERATURE)
                .max_tokens(CHART_MAX_TOKENS);
            let response = match self.llm.complete(request).await {
                Ok(response) => response,
                Err(error) => {
                    warn!(
                        event_name = "summarize.chart_skipped",
                        attempt,
                        error = %error,
                        "chart request failed"
                    );
                    return None;
                }
            };

            match ChartSpec::parse(&response) {
                Ok(mut chart) => {
                    let bound = chart.bind_selection_params(result);
                    info!(
                        event_name = "summarize.chart_ready",
                        attempt,
                        bound_params = bound.len(),
                        "chart drawn"
                    );
                    return Some(chart);
                }
                Err(error) => {
                    warn!(
                        event_name = "summarize.chart_invalid",
                        attempt,
                        error = %error,
                        "chart rejected"
                    );
                    let feedback = match self.prompts.chart_fix(
                        &response,
                        &preview.columns,
                        chart_error_kind(&error),
                        &error.to_string(),
                    ) {
                        Ok(feedback) => feedback,
                        Err(_) => return None,
                    };
                    messages.push(ChatMessage::assistant(response));
                    messages.push(ChatMessage::user(feedback));
                }
            }
        }

        warn!(
            event_name = "summarize.chart_abandoned",
            attempts = self.max_chart_attempts,
            "answer will carry no chart"
        );
        None
    }
}

fn chart_error_kind(error: &ChartError) -> &'static str {
    match error {
        ChartError::MissingObject => "MissingObject",
        ChartError::InvalidJson(_) => "InvalidJson",
        ChartError::MissingMark => "MissingMark",
    }
}

/// One `name  type` line per column.
fn describe_columns(result: &ResultSet) -> String {
    result
        .columns
        .iter()
        .map(|column| format!("{}  {}", column.name, column.data_type))
        .collect::<Vec<_>>()
        .join("\n")
}
