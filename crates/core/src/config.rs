use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub warehouse: WarehouseConfig,
    pub llm: LlmConfig,
    pub database: DatabaseConfig,
    pub metadata: MetadataConfig,
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct WarehouseConfig {
    pub endpoint: String,
    pub catalog: String,
    pub database: String,
    pub user: String,
    pub access_key: Option<SecretString>,
    pub secret_key: Option<SecretString>,
    pub region: String,
    pub session_properties: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub query_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct MetadataConfig {
    pub path: PathBuf,
    pub extra_descriptions_path: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub max_fix_attempts: u32,
    pub max_chart_attempts: u32,
    pub max_result_rows: usize,
    pub history_turns: usize,
    /// Ask the model for an analysis plan before drafting SQL.
    pub analysis_plan: bool,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ark,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub warehouse_endpoint: Option<String>,
    pub warehouse_catalog: Option<String>,
    pub warehouse_database: Option<String>,
    pub metadata_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            warehouse: WarehouseConfig {
                endpoint: String::new(),
                catalog: "hive_catalog".to_string(),
                database: "test_db".to_string(),
                user: "tally".to_string(),
                access_key: None,
                secret_key: None,
                region: "cn-beijing".to_string(),
                session_properties: BTreeMap::from([(
                    "query_engine_type".to_string(),
                    "presto".to_string(),
                )]),
                timeout_secs: 30,
                query_timeout_secs: 300,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: None,
                model: "llama3.1".to_string(),
                timeout_secs: 60,
                max_retries: 2,
            },
            database: DatabaseConfig {
                url: "sqlite://tally.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            metadata: MetadataConfig {
                path: PathBuf::from("crm_metadata.json"),
                extra_descriptions_path: None,
            },
            pipeline: PipelineConfig {
                max_fix_attempts: 3,
                max_chart_attempts: 3,
                max_result_rows: 50,
                history_turns: 5,
                analysis_plan: false,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                allowed_origins: Vec::new(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ark" => Ok(Self::Ark),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ark|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl LlmProvider {
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ark => "https://ark.cn-beijing.volces.com/api/v3",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn requires_api_key(self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

impl LlmConfig {
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

impl WarehouseConfig {
    /// Value for the `X-Presto-Session` header, `None` when no properties are set.
    pub fn session_header(&self) -> Option<String> {
        if self.session_properties.is_empty() {
            return None;
        }
        Some(
            self.session_properties
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tally.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(warehouse) = patch.warehouse {
            if let Some(endpoint) = warehouse.endpoint {
                self.warehouse.endpoint = endpoint;
            }
            if let Some(catalog) = warehouse.catalog {
                self.warehouse.catalog = catalog;
            }
            if let Some(database) = warehouse.database {
                self.warehouse.database = database;
            }
            if let Some(user) = warehouse.user {
                self.warehouse.user = user;
            }
            if let Some(access_key_value) = warehouse.access_key {
                self.warehouse.access_key = Some(secret_value(access_key_value));
            }
            if let Some(secret_key_value) = warehouse.secret_key {
                self.warehouse.secret_key = Some(secret_value(secret_key_value));
            }
            if let Some(region) = warehouse.region {
                self.warehouse.region = region;
            }
            if let Some(session_properties) = warehouse.session_properties {
                self.warehouse.session_properties = session_properties;
            }
            if let Some(timeout_secs) = warehouse.timeout_secs {
                self.warehouse.timeout_secs = timeout_secs;
            }
            if let Some(query_timeout_secs) = warehouse.query_timeout_secs {
                self.warehouse.query_timeout_secs = query_timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(metadata) = patch.metadata {
            if let Some(path) = metadata.path {
                self.metadata.path = path;
            }
            if let Some(extra_descriptions_path) = metadata.extra_descriptions_path {
                self.metadata.extra_descriptions_path = Some(extra_descriptions_path);
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(max_fix_attempts) = pipeline.max_fix_attempts {
                self.pipeline.max_fix_attempts = max_fix_attempts;
            }
            if let Some(max_chart_attempts) = pipeline.max_chart_attempts {
                self.pipeline.max_chart_attempts = max_chart_attempts;
            }
            if let Some(max_result_rows) = pipeline.max_result_rows {
                self.pipeline.max_result_rows = max_result_rows;
            }
            if let Some(history_turns) = pipeline.history_turns {
                self.pipeline.history_turns = history_turns;
            }
            if let Some(analysis_plan) = pipeline.analysis_plan {
                self.pipeline.analysis_plan = analysis_plan;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(allowed_origins) = server.allowed_origins {
                self.server.allowed_origins = allowed_origins;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TALLY_WAREHOUSE_ENDPOINT") {
            self.warehouse.endpoint = value;
        }
        if let Some(value) = read_env("TALLY_WAREHOUSE_CATALOG") {
            self.warehouse.catalog = value;
        }
        if let Some(value) = read_env("TALLY_WAREHOUSE_DATABASE") {
            self.warehouse.database = value;
        }
        if let Some(value) = read_env("TALLY_WAREHOUSE_USER") {
            self.warehouse.user = value;
        }
        if let Some(value) = read_env("TALLY_WAREHOUSE_ACCESS_KEY") {
            self.warehouse.access_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TALLY_WAREHOUSE_SECRET_KEY") {
            self.warehouse.secret_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TALLY_WAREHOUSE_REGION") {
            self.warehouse.region = value;
        }
        if let Some(value) = read_env("TALLY_WAREHOUSE_SESSION_PROPERTIES") {
            self.warehouse.session_properties =
                parse_properties("TALLY_WAREHOUSE_SESSION_PROPERTIES", &value)?;
        }
        if let Some(value) = read_env("TALLY_WAREHOUSE_TIMEOUT_SECS") {
            self.warehouse.timeout_secs = parse_u64("TALLY_WAREHOUSE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TALLY_WAREHOUSE_QUERY_TIMEOUT_SECS") {
            self.warehouse.query_timeout_secs =
                parse_u64("TALLY_WAREHOUSE_QUERY_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TALLY_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("TALLY_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TALLY_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("TALLY_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("TALLY_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("TALLY_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TALLY_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("TALLY_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("TALLY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TALLY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("TALLY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TALLY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TALLY_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TALLY_METADATA_PATH") {
            self.metadata.path = PathBuf::from(value);
        }
        if let Some(value) = read_env("TALLY_METADATA_EXTRA_DESCRIPTIONS_PATH") {
            self.metadata.extra_descriptions_path = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("TALLY_PIPELINE_MAX_FIX_ATTEMPTS") {
            self.pipeline.max_fix_attempts = parse_u32("TALLY_PIPELINE_MAX_FIX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("TALLY_PIPELINE_MAX_CHART_ATTEMPTS") {
            self.pipeline.max_chart_attempts =
                parse_u32("TALLY_PIPELINE_MAX_CHART_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("TALLY_PIPELINE_MAX_RESULT_ROWS") {
            self.pipeline.max_result_rows = parse_usize("TALLY_PIPELINE_MAX_RESULT_ROWS", &value)?;
        }
        if let Some(value) = read_env("TALLY_PIPELINE_HISTORY_TURNS") {
            self.pipeline.history_turns = parse_usize("TALLY_PIPELINE_HISTORY_TURNS", &value)?;
        }
        if let Some(value) = read_env("TALLY_PIPELINE_ANALYSIS_PLAN") {
            self.pipeline.analysis_plan = parse_bool("TALLY_PIPELINE_ANALYSIS_PLAN", &value)?;
        }

        if let Some(value) = read_env("TALLY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        // PORT is what most container platforms inject.
        if let Some(value) = read_env("TALLY_SERVER_PORT").or_else(|| read_env("PORT")) {
            self.server.port = parse_u16("TALLY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("TALLY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TALLY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("TALLY_SERVER_ALLOWED_ORIGINS") {
            self.server.allowed_origins = parse_list(&value);
        }

        let log_level = read_env("TALLY_LOGGING_LEVEL").or_else(|| read_env("TALLY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("TALLY_LOGGING_FORMAT").or_else(|| read_env("TALLY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = Some(llm_base_url);
        }
        if let Some(endpoint) = overrides.warehouse_endpoint {
            self.warehouse.endpoint = endpoint;
        }
        if let Some(catalog) = overrides.warehouse_catalog {
            self.warehouse.catalog = catalog;
        }
        if let Some(database) = overrides.warehouse_database {
            self.warehouse.database = database;
        }
        if let Some(metadata_path) = overrides.metadata_path {
            self.metadata.path = metadata_path;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_warehouse(&self.warehouse)?;
        validate_llm(&self.llm)?;
        validate_database(&self.database)?;
        validate_pipeline(&self.pipeline)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tally.toml"), PathBuf::from("config/tally.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_warehouse(warehouse: &WarehouseConfig) -> Result<(), ConfigError> {
    let endpoint = warehouse.endpoint.trim();
    if endpoint.is_empty() {
        return Err(ConfigError::Validation(
            "warehouse.endpoint is required \
             (the Presto coordinator URL, e.g. `https://presto.example.com`)"
                .to_string(),
        ));
    }
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(ConfigError::Validation(
            "warehouse.endpoint must start with http:// or https://".to_string(),
        ));
    }

    if warehouse.catalog.trim().is_empty() || warehouse.database.trim().is_empty() {
        return Err(ConfigError::Validation(
            "warehouse.catalog and warehouse.database must not be empty".to_string(),
        ));
    }

    if warehouse.user.trim().is_empty() {
        return Err(ConfigError::Validation("warehouse.user must not be empty".to_string()));
    }

    if warehouse.access_key.is_some() != warehouse.secret_key.is_some() {
        return Err(ConfigError::Validation(
            "warehouse.access_key and warehouse.secret_key must be configured together"
                .to_string(),
        ));
    }

    if warehouse.timeout_secs == 0 || warehouse.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "warehouse.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if warehouse.query_timeout_secs == 0 || warehouse.query_timeout_secs > 3600 {
        return Err(ConfigError::Validation(
            "warehouse.query_timeout_secs must be in range 1..=3600".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.provider.requires_api_key() {
        let missing = llm
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(
                "llm.api_key is required for openai/ark providers".to_string(),
            ));
        }
    }

    let base_url = llm.effective_base_url();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    Ok(())
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if pipeline.max_fix_attempts == 0 {
        return Err(ConfigError::Validation(
            "pipeline.max_fix_attempts must be greater than zero".to_string(),
        ));
    }
    if pipeline.max_chart_attempts == 0 {
        return Err(ConfigError::Validation(
            "pipeline.max_chart_attempts must be greater than zero".to_string(),
        ));
    }
    if pipeline.max_result_rows == 0 {
        return Err(ConfigError::Validation(
            "pipeline.max_result_rows must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    for origin in &server.allowed_origins {
        let valid =
            origin == "*" || origin.starts_with("http://") || origin.starts_with("https://");
        if !valid {
            return Err(ConfigError::Validation(format!(
                "server.allowed_origins entry `{origin}` must be `*` \
                 or start with http:// or https://"
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_properties(key: &str, value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut properties = BTreeMap::new();
    for pair in parse_list(value) {
        let Some((name, property)) = pair.split_once('=') else {
            return Err(ConfigError::InvalidEnvOverride {
                key: key.to_string(),
                value: value.to_string(),
            });
        };
        properties.insert(name.trim().to_string(), property.trim().to_string());
    }
    Ok(properties)
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    warehouse: Option<WarehousePatch>,
    llm: Option<LlmPatch>,
    database: Option<DatabasePatch>,
    metadata: Option<MetadataPatch>,
    pipeline: Option<PipelinePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct WarehousePatch {
    endpoint: Option<String>,
    catalog: Option<String>,
    database: Option<String>,
    user: Option<String>,
    access_key: Option<String>,
    secret_key: Option<String>,
    region: Option<String>,
    session_properties: Option<BTreeMap<String, String>>,
    timeout_secs: Option<u64>,
    query_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataPatch {
    path: Option<PathBuf>,
    extra_descriptions_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    max_fix_attempts: Option<u32>,
    max_chart_attempts: Option<u32>,
    max_result_rows: Option<usize>,
    history_turns: Option<usize>,
    analysis_plan: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
