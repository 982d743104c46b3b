use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use tally_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

impl Field {
    fn new(key: &'static str, env_keys: &'static [&'static str], value: impl Into<String>) -> Self {
        Self { key, env_keys, value: value.into() }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let warehouse = &config.warehouse;
    let session_properties = warehouse
        .session_properties
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",");

    vec![
        Field::new("warehouse.endpoint", &["TALLY_WAREHOUSE_ENDPOINT"], &warehouse.endpoint),
        Field::new("warehouse.catalog", &["TALLY_WAREHOUSE_CATALOG"], &warehouse.catalog),
        Field::new("warehouse.database", &["TALLY_WAREHOUSE_DATABASE"], &warehouse.database),
        Field::new("warehouse.user", &["TALLY_WAREHOUSE_USER"], &warehouse.user),
        Field::new(
            "warehouse.access_key",
            &["TALLY_WAREHOUSE_ACCESS_KEY"],
            redact_secret(warehouse.access_key.as_ref()),
        ),
        Field::new(
            "warehouse.secret_key",
            &["TALLY_WAREHOUSE_SECRET_KEY"],
            if warehouse.secret_key.is_some() { "<redacted>" } else { "<unset>" },
        ),
        Field::new("warehouse.region", &["TALLY_WAREHOUSE_REGION"], &warehouse.region),
        Field::new(
            "warehouse.session_properties",
            &["TALLY_WAREHOUSE_SESSION_PROPERTIES"],
            session_properties,
        ),
        Field::new(
            "warehouse.timeout_secs",
            &["TALLY_WAREHOUSE_TIMEOUT_SECS"],
            warehouse.timeout_secs.to_string(),
        ),
        Field::new(
            "warehouse.query_timeout_secs",
            &["TALLY_WAREHOUSE_QUERY_TIMEOUT_SECS"],
            warehouse.query_timeout_secs.to_string(),
        ),
        Field::new(
            "llm.provider",
            &["TALLY_LLM_PROVIDER"],
            format!("{:?}", config.llm.provider).to_lowercase(),
        ),
        Field::new("llm.model", &["TALLY_LLM_MODEL"], &config.llm.model),
        Field::new("llm.base_url", &["TALLY_LLM_BASE_URL"], config.llm.effective_base_url()),
        Field::new(
            "llm.api_key",
            &["TALLY_LLM_API_KEY"],
            redact_secret(config.llm.api_key.as_ref()),
        ),
        Field::new(
            "llm.timeout_secs",
            &["TALLY_LLM_TIMEOUT_SECS"],
            config.llm.timeout_secs.to_string(),
        ),
        Field::new(
            "llm.max_retries",
            &["TALLY_LLM_MAX_RETRIES"],
            config.llm.max_retries.to_string(),
        ),
        Field::new("database.url", &["TALLY_DATABASE_URL"], &config.database.url),
        Field::new(
            "database.max_connections",
            &["TALLY_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        Field::new(
            "database.timeout_secs",
            &["TALLY_DATABASE_TIMEOUT_SECS"],
            config.database.timeout_secs.to_string(),
        ),
        Field::new(
            "metadata.path",
            &["TALLY_METADATA_PATH"],
            config.metadata.path.display().to_string(),
        ),
        Field::new(
            "metadata.extra_descriptions_path",
            &["TALLY_METADATA_EXTRA_DESCRIPTIONS_PATH"],
            config
                .metadata
                .extra_descriptions_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<unset>".to_string()),
        ),
        Field::new(
            "pipeline.max_fix_attempts",
            &["TALLY_PIPELINE_MAX_FIX_ATTEMPTS"],
            config.pipeline.max_fix_attempts.to_string(),
        ),
        Field::new(
            "pipeline.max_chart_attempts",
            &["TALLY_PIPELINE_MAX_CHART_ATTEMPTS"],
            config.pipeline.max_chart_attempts.to_string(),
        ),
        Field::new(
            "pipeline.max_result_rows",
            &["TALLY_PIPELINE_MAX_RESULT_ROWS"],
            config.pipeline.max_result_rows.to_string(),
        ),
        Field::new(
            "pipeline.history_turns",
            &["TALLY_PIPELINE_HISTORY_TURNS"],
            config.pipeline.history_turns.to_string(),
        ),
        Field::new(
            "pipeline.analysis_plan",
            &["TALLY_PIPELINE_ANALYSIS_PLAN"],
            config.pipeline.analysis_plan.to_string(),
        ),
        Field::new(
            "server.bind_address",
            &["TALLY_SERVER_BIND_ADDRESS"],
            &config.server.bind_address,
        ),
        Field::new("server.port", &["TALLY_SERVER_PORT", "PORT"], config.server.port.to_string()),
        Field::new(
            "server.graceful_shutdown_secs",
            &["TALLY_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            config.server.graceful_shutdown_secs.to_string(),
        ),
        Field::new(
            "server.allowed_origins",
            &["TALLY_SERVER_ALLOWED_ORIGINS"],
            if config.server.allowed_origins.is_empty() {
                "<none>".to_string()
            } else {
                config.server.allowed_origins.join(",")
            },
        ),
        Field::new(
            "logging.level",
            &["TALLY_LOGGING_LEVEL", "TALLY_LOG_LEVEL"],
            &config.logging.level,
        ),
        Field::new(
            "logging.format",
            &["TALLY_LOGGING_FORMAT", "TALLY_LOG_FORMAT"],
            format!("{:?}", config.logging.format).to_lowercase(),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("tally.toml"), PathBuf::from("config/tally.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a vendor prefix such as `sk-` or `AKLT-` and hides the rest.
fn redact_secret(secret: Option<&SecretString>) -> String {
    let Some(secret) = secret else {
        return "<unset>".to_string();
    };
    let trimmed = secret.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use toml::Value;

    use super::{contains_path, redact_secret};

    #[test]
    fn secrets_keep_only_their_prefix() {
        assert_eq!(redact_secret(None), "<unset>");
        let secret = |value: &str| SecretString::from(value.to_string());
        assert_eq!(redact_secret(Some(&secret("sk-live-abcdef"))), "sk-***");
        assert_eq!(redact_secret(Some(&secret("plainsecret"))), "<redacted>");
        assert_eq!(redact_secret(Some(&SecretString::from("  ".to_string()))), "<empty>");
    }

    #[test]
    fn nested_keys_are_found_in_config_file() {
        let doc: Value = "[warehouse]\nendpoint = \"http://presto:8080\"\n".parse().expect("toml");
        assert!(contains_path(&doc, "warehouse.endpoint"));
        assert!(!contains_path(&doc, "warehouse.catalog"));
        assert!(!contains_path(&doc, "llm.model"));
    }
}
