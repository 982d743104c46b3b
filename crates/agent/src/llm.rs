use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tally_core::config::LlmConfig;
use tally_core::errors::{ConnectivityTarget, PipelineError};
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Asks for `response_format: {"type": "json_object"}`.
    pub json_response: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages, temperature: 0.1, max_tokens: 4096, json_response: false }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn json_response(mut self) -> Self {
        self.json_response = true;
        self
    }

    /// The content of every user message, joined. Used by fakes and logs.
    pub fn user_text(&self) -> String {
        self.messages
            .iter()
            .filter(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("model request timed out after {0} seconds")]
    Timeout(u64),
    #[error("model endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("model returned an empty completion")]
    EmptyResponse,
    #[error("model response could not be decoded: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::EmptyResponse | Self::MalformedResponse(_) => false,
        }
    }

    /// Unreachable or overloaded endpoints are connectivity failures; anything
    /// else is charged to the step that made the call.
    pub fn into_pipeline_error<F>(self, step: F) -> PipelineError
    where
        F: FnOnce(String) -> PipelineError,
    {
        if self.is_retryable() {
            PipelineError::connectivity(ConnectivityTarget::Model, self.to_string())
        } else {
            step(self.to_string())
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;
}

/// Chat-completions client for OpenAI, Ark and Ollama style endpoints.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    timeout_secs: u64,
    max_retries: u32,
    retry_backoff: Duration,
}

impl OpenAiCompatibleClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;

        Ok(Self {
            http,
            base_url: config.effective_base_url(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout_secs: config.timeout_secs.max(1),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(500),
        })
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if request.json_response {
            body["response_format"] = json!({ "type": "json_object" });
        }

        let mut builder =
            self.http.post(format!("{}/chat/completions", self.base_url)).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| self.map_transport(error))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http { status: status.as_u16(), body });
        }

        let completion: ChatCompletion =
            response.json().await.map_err(|error| self.map_transport(error))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(content)
    }

    fn map_transport(&self, error: reqwest::Error) -> LlmError {
        if error.is_timeout() {
            LlmError::Timeout(self.timeout_secs)
        } else if error.is_decode() {
            LlmError::MalformedResponse(error.to_string())
        } else {
            LlmError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.send_once(&request).await {
                Ok(content) => return Ok(content),
                Err(error) if error.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "llm.request.retry",
                        attempt,
                        max_retries = self.max_retries,
                        error = %error,
                        "retrying model request"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
