use serde::Deserialize;
use tally_core::errors::{ConnectivityTarget, ExecutionFailure, ExecutionFailureKind, PipelineError};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WarehouseError {
    #[error("{message}")]
    Query { kind: ExecutionFailureKind, message: String, error_name: Option<String> },
    #[error("warehouse returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("warehouse request failed: {0}")]
    Transport(String),
    #[error("query did not finish within {0} seconds")]
    Deadline(u64),
    #[error("unexpected warehouse response: {0}")]
    Protocol(String),
}

impl WarehouseError {
    pub fn failure_kind(&self) -> Option<ExecutionFailureKind> {
        match self {
            Self::Query { kind, .. } => Some(*kind),
            Self::Http { status: 401 | 403, .. } => Some(ExecutionFailureKind::Permission),
            Self::Http { status, .. } if *status < 500 => Some(ExecutionFailureKind::Other),
            Self::Deadline(_) => Some(ExecutionFailureKind::Timeout),
            Self::Protocol(_) => Some(ExecutionFailureKind::Other),
            Self::Http { .. } | Self::Transport(_) => None,
        }
    }

    /// Query-level failures map to an execution failure; an unreachable
    /// coordinator maps to a connectivity failure.
    pub fn into_pipeline_error(self) -> PipelineError {
        match self.failure_kind() {
            Some(kind) => {
                let message = match self {
                    Self::Query { message, .. } => message,
                    other => other.to_string(),
                };
                PipelineError::Execution(ExecutionFailure::new(kind, message))
            }
            None => PipelineError::connectivity(ConnectivityTarget::Warehouse, self.to_string()),
        }
    }
}

impl From<reqwest::Error> for WarehouseError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::Protocol(error.to_string());
        }
        Self::Transport(error.to_string())
    }
}

/// Error object embedded in a Presto `QueryResults` document.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryErrorBody {
    pub message: String,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub error_name: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
}

const SYNTAX_ERROR_CODE: i64 = 1;
const PERMISSION_DENIED_CODE: i64 = 4;

impl QueryErrorBody {
    pub fn classify(&self) -> ExecutionFailureKind {
        let name = self.error_name.as_deref().unwrap_or_default();
        let error_type = self.error_type.as_deref().unwrap_or_default();

        if name == "PERMISSION_DENIED" || self.error_code == Some(PERMISSION_DENIED_CODE) {
            return ExecutionFailureKind::Permission;
        }
        if name == "EXCEEDED_TIME_LIMIT" || name == "ABANDONED_QUERY" {
            return ExecutionFailureKind::Timeout;
        }
        if name == "SYNTAX_ERROR"
            || self.error_code == Some(SYNTAX_ERROR_CODE)
            || error_type == "USER_ERROR"
        {
            return ExecutionFailureKind::Syntax;
        }
        ExecutionFailureKind::Other
    }

    pub fn into_error(self) -> WarehouseError {
        let kind = self.classify();
        WarehouseError::Query { kind, message: self.message, error_name: self.error_name }
    }
}
