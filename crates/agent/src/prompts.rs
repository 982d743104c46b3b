//! Prompt templates rendered with `tera`. Templates live in `templates/` and are
//! compiled into the binary.

use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

const TEMPLATES: [(&str, &str); 9] = [
    ("analysis_plan.md", include_str!("../templates/analysis_plan.md")),
    ("generation_system.md", include_str!("../templates/generation_system.md")),
    ("generation.md", include_str!("../templates/generation.md")),
    ("correction_system.md", include_str!("../templates/correction_system.md")),
    ("correction.md", include_str!("../templates/correction.md")),
    ("summary.md", include_str!("../templates/summary.md")),
    ("chart.md", include_str!("../templates/chart.md")),
    ("chart_fix.md", include_str!("../templates/chart_fix.md")),
    ("column_description.md", include_str!("../templates/column_description.md")),
];

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template error: {0}")]
    Template(String),
}

impl From<tera::Error> for PromptError {
    fn from(error: tera::Error) -> Self {
        Self::Template(error.to_string())
    }
}

/// One earlier exchange as shown to the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistoryTurn {
    pub question: String,
    pub sql: String,
    pub answer: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResultPreview<'a> {
    pub question: &'a str,
    pub sql: &'a str,
    pub columns: String,
    pub csv: String,
    pub shown: usize,
    pub row_count: usize,
    pub truncated: bool,
}

#[derive(Clone, Debug)]
pub struct Prompts {
    tera: Tera,
}

impl Prompts {
    pub fn new() -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(TEMPLATES)?;
        Ok(Self { tera })
    }

    pub fn analysis_plan_system(&self) -> Result<String, PromptError> {
        self.render("analysis_plan.md", &Context::new())
    }

    pub fn generation_system(&self) -> Result<String, PromptError> {
        self.render("generation_system.md", &Context::new())
    }

    pub fn generation(
        &self,
        request: &str,
        catalog: &str,
        database: &str,
        schema: &str,
        history: &[HistoryTurn],
        plan: Option<&str>,
    ) -> Result<String, PromptError> {
        let mut context = warehouse_context(catalog, database, schema);
        context.insert("request", request);
        context.insert("history", history);
        context.insert("plan", &plan.map(str::trim).unwrap_or_default());
        self.render("generation.md", &context)
    }

    pub fn correction_system(
        &self,
        catalog: &str,
        database: &str,
        schema: &str,
    ) -> Result<String, PromptError> {
        self.render("correction_system.md", &warehouse_context(catalog, database, schema))
    }

    pub fn correction(&self, sql: &str, error: &str) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("sql", sql);
        context.insert("error", error);
        self.render("correction.md", &context)
    }

    pub fn summary(&self, preview: &ResultPreview<'_>) -> Result<String, PromptError> {
        self.render("summary.md", &Context::from_serialize(preview)?)
    }

    pub fn chart(&self, preview: &ResultPreview<'_>) -> Result<String, PromptError> {
        self.render("chart.md", &Context::from_serialize(preview)?)
    }

    pub fn chart_fix(
        &self,
        chart: &str,
        columns: &str,
        error_kind: &str,
        error: &str,
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("chart", chart.trim());
        context.insert("columns", columns);
        context.insert("error_kind", error_kind);
        context.insert("error", error);
        Ok(self.render("chart_fix.md", &context)?.trim().to_owned())
    }

    pub fn column_description(
        &self,
        table: &str,
        column: &str,
        data_type: &str,
        samples: &[serde_json::Value],
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("table", table);
        context.insert("column", column);
        context.insert("data_type", data_type);
        context.insert("samples", &serde_json::to_string(samples).unwrap_or_default());
        self.render("column_description.md", &context)
    }

    fn render(&self, name: &str, context: &Context) -> Result<String, PromptError> {
        Ok(self.tera.render(name, context)?)
    }
}

fn warehouse_context(catalog: &str, database: &str, schema: &str) -> Context {
    let mut context = Context::new();
    context.insert("catalog", catalog);
    context.insert("database", database);
    context.insert("schema", schema);
    context
}
