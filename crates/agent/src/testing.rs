//! Scripted collaborators shared by the unit tests of this crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tally_core::domain::result_set::{Column, ResultSet};
use tally_warehouse::{Warehouse, WarehouseError};

use crate::llm::{CompletionRequest, LlmClient, LlmError, Role};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromptKind {
    AnalysisPlan,
    Generation,
    Correction,
    Summary,
    Chart,
    ChartFix,
    ColumnDescription,
}

pub fn classify(request: &CompletionRequest) -> PromptKind {
    let system = request
        .messages
        .iter()
        .filter(|message| message.role == Role::System)
        .map(|message| message.content.as_str())
        .collect::<String>();
    let last_user = request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(|message| message.content.as_str())
        .unwrap_or_default();

    if system.contains("concrete analysis plans") {
        PromptKind::AnalysisPlan
    } else if system.contains("SQL Correction Tool") {
        PromptKind::Correction
    } else if system.contains("Senior Data Engineer") {
        PromptKind::Generation
    } else if last_user.contains("You made a mistake!") {
        PromptKind::ChartFix
    } else if last_user.contains("Vega-Lite") {
        PromptKind::Chart
    } else if last_user.contains("creating documentation") {
        PromptKind::ColumnDescription
    } else {
        PromptKind::Summary
    }
}

type Responder = dyn Fn(PromptKind, &CompletionRequest) -> Result<String, LlmError> + Send + Sync;

pub struct ScriptedLlm {
    responder: Box<Responder>,
    calls: Mutex<Vec<(PromptKind, CompletionRequest)>>,
    hold_generation: bool,
}

impl ScriptedLlm {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(PromptKind, &CompletionRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            hold_generation: false,
        }
    }

    /// Answers every prompt kind with a sensible default for the accounts fixture.
    pub fn happy() -> Self {
        Self::new(|kind, request| Ok(default_response(kind, request)))
    }

    /// Generation requests never complete.
    pub fn holding_generation(mut self) -> Self {
        self.hold_generation = true;
        self
    }

    pub fn kinds(&self) -> Vec<PromptKind> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(kind, _)| *kind).collect())
            .unwrap_or_default()
    }

    pub fn requests(&self, kind: PromptKind) -> Vec<CompletionRequest> {
        self.calls
            .lock()
            .map(|calls| {
                calls
                    .iter()
                    .filter(|(seen, _)| *seen == kind)
                    .map(|(_, request)| request.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn default_response(kind: PromptKind, request: &CompletionRequest) -> String {
    match kind {
        PromptKind::AnalysisPlan => {
            concat!(
                "**1. Interpretation(s)** Rank Customers by AnnualRevenue.\n",
                "**4. Conceptual Data Steps** 1. Read Account. 2. Sort by AnnualRevenue.",
            )
            .to_owned()
        }
        PromptKind::Generation | PromptKind::Correction => {
            concat!(
                "```sql\nSELECT \"Name\", \"AnnualRevenue\" ",
                "FROM \"hive_catalog\".\"test_db\".\"Account\"\n```",
            )
            .to_owned()
        }
        PromptKind::Summary => {
            let question = request
                .user_text()
                .lines()
                .skip_while(|line| !line.starts_with("**Question:**"))
                .nth(1)
                .unwrap_or_default()
                .to_owned();
            format!("Answer for: {question}")
        }
        PromptKind::Chart | PromptKind::ChartFix => {
            concat!(
                r#"{"mark": "bar", "encoding": "#,
                r#"{"x": {"field": "Name"}, "y": {"field": "AnnualRevenue"}}}"#,
            )
            .to_owned()
        }
        PromptKind::ColumnDescription => "Generated description.".to_owned(),
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let kind = classify(&request);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((kind, request.clone()));
        }
        if self.hold_generation && kind == PromptKind::Generation {
            std::future::pending::<()>().await;
        }
        (self.responder)(kind, &request)
    }
}

type Executor = dyn Fn(&str) -> Result<ResultSet, WarehouseError> + Send + Sync;

pub struct FixtureWarehouse {
    executor: Box<Executor>,
    statements: Arc<Mutex<Vec<String>>>,
}

impl FixtureWarehouse {
    pub fn new<F>(executor: F) -> Self
    where
        F: Fn(&str) -> Result<ResultSet, WarehouseError> + Send + Sync + 'static,
    {
        Self { executor: Box::new(executor), statements: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Three accounts; EXPLAIN always succeeds; unknown tables are syntax errors.
    pub fn accounts() -> Self {
        Self::new(|sql| {
            if sql.contains("\"Account\"") || sql.starts_with("EXPLAIN") {
                Ok(accounts())
            } else {
                Err(missing_table("Nope"))
            }
        })
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().map(|statements| statements.clone()).unwrap_or_default()
    }

    pub fn executed(&self) -> Vec<String> {
        self.statements().into_iter().filter(|sql| !sql.starts_with("EXPLAIN")).collect()
    }
}

pub fn accounts() -> ResultSet {
    ResultSet {
        columns: vec![Column::new("Name", "varchar"), Column::new("AnnualRevenue", "double")],
        rows: vec![
            vec![json!("Acme"), json!(1_200_000.0)],
            vec![json!("Globex"), json!(830_000.0)],
            vec![json!("Initech"), json!(410_000.0)],
        ],
    }
}

pub fn missing_table(table: &str) -> WarehouseError {
    WarehouseError::Query {
        kind: tally_core::errors::ExecutionFailureKind::Syntax,
        message: format!("line 1:15: Table hive_catalog.test_db.{table} does not exist"),
        error_name: Some("TABLE_NOT_FOUND".to_owned()),
    }
}

#[async_trait]
impl Warehouse for FixtureWarehouse {
    fn catalog(&self) -> &str {
        "hive_catalog"
    }

    fn database(&self) -> &str {
        "test_db"
    }

    async fn execute(&self, sql: &str) -> Result<ResultSet, WarehouseError> {
        if let Ok(mut statements) = self.statements.lock() {
            statements.push(sql.to_owned());
        }
        (self.executor)(sql)
    }
}
