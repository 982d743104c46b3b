use serde::Serialize;
use tally_core::config::AppConfig;
use tally_core::schema::SchemaCatalog;
use tally_db::connect_with_settings;
use tally_warehouse::{PrestoClient, Warehouse};

use crate::commands::{load_config, runtime, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            details: "skipped because configuration did not load".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 3] =
    ["database_connectivity", "warehouse_connectivity", "metadata_catalog"];

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\
                 \"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult { exit_code, output };
    }

    CommandResult { exit_code, output: render_human(&report) }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match load_config("doctor") {
        Ok(config) => {
            checks.push(DoctorCheck::pass(
                "config_validation",
                "configuration loaded and validated",
            ));
            match runtime("doctor") {
                Ok(runtime) => {
                    checks.push(runtime.block_on(check_database_connectivity(&config)));
                    checks.push(runtime.block_on(check_warehouse_connectivity(&config)));
                }
                Err(failure) => {
                    checks.push(DoctorCheck::fail("database_connectivity", failure.output.clone()));
                    checks.push(DoctorCheck::fail("warehouse_connectivity", failure.output));
                }
            }
            checks.push(check_metadata(&config));
        }
        Err(failure) => {
            checks.push(DoctorCheck::fail("config_validation", failure.output));
            checks.extend(DEPENDENT_CHECKS.into_iter().map(DoctorCheck::skipped));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

async fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let result = async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to session database: {error}"))?;

        pool.close().await;
        Ok::<(), String>(())
    }
    .await;

    match result {
        Ok(()) => DoctorCheck::pass(
            "database_connectivity",
            format!("connected using `{}`", config.database.url),
        ),
        Err(error) => DoctorCheck::fail("database_connectivity", error),
    }
}

async fn check_warehouse_connectivity(config: &AppConfig) -> DoctorCheck {
    let client = match PrestoClient::from_config(&config.warehouse) {
        Ok(client) => client,
        Err(error) => return DoctorCheck::fail("warehouse_connectivity", error.to_string()),
    };

    match client.list_tables().await {
        Ok(tables) => DoctorCheck::pass(
            "warehouse_connectivity",
            format!(
                "reached `{}`; {} tables in {}.{}",
                config.warehouse.endpoint,
                tables.len(),
                config.warehouse.catalog,
                config.warehouse.database
            ),
        ),
        Err(error) => DoctorCheck::fail(
            "warehouse_connectivity",
            format!("could not list tables at `{}`: {error}", config.warehouse.endpoint),
        ),
    }
}

fn check_metadata(config: &AppConfig) -> DoctorCheck {
    let path = &config.metadata.path;
    if !path.exists() {
        return DoctorCheck::fail(
            "metadata_catalog",
            format!("`{}` not found; run `tally refresh-metadata`", path.display()),
        );
    }

    match SchemaCatalog::load(path) {
        Ok(catalog) => DoctorCheck::pass(
            "metadata_catalog",
            format!("{} tables described in `{}`", catalog.len(), path.display()),
        ),
        Err(error) => DoctorCheck::fail("metadata_catalog", error.to_string()),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
