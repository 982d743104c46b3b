use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::PipelineTransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error(transparent)]
    PipelineTransition(#[from] PipelineTransitionError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionFailureKind {
    Syntax,
    Permission,
    Timeout,
    Other,
}

#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("query execution failed ({kind}): {message}")]
pub struct ExecutionFailure {
    pub kind: ExecutionFailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: ExecutionFailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for ExecutionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Syntax => "syntax",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityTarget {
    Warehouse,
    Model,
}

impl fmt::Display for ConnectivityTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warehouse => f.write_str("warehouse"),
            Self::Model => f.write_str("language model"),
        }
    }
}

/// Failure of a single pipeline run. Every variant carries enough text to be
/// shown to the user as-is.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid question: {0}")]
    InvalidQuestion(String),
    #[error("query generation failed: {0}")]
    Generation(String),
    #[error(transparent)]
    Execution(#[from] ExecutionFailure),
    #[error("summarization failed: {0}")]
    Summarization(String),
    #[error("{target} unreachable: {message}")]
    Connectivity { target: ConnectivityTarget, message: String },
    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn connectivity(target: ConnectivityTarget, message: impl Into<String>) -> Self {
        Self::Connectivity { target, message: message.into() }
    }

    /// Stable identifier surfaced to clients in the terminal `Failed` event.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::InvalidQuestion(_) => "invalid_question",
            Self::Generation(_) => "generation_failure",
            Self::Execution(failure) => match failure.kind {
                ExecutionFailureKind::Syntax => "execution_syntax",
                ExecutionFailureKind::Permission => "execution_permission",
                ExecutionFailureKind::Timeout => "execution_timeout",
                ExecutionFailureKind::Other => "execution_failure",
            },
            Self::Summarization(_) => "summarization_failure",
            Self::Connectivity { .. } => "connectivity_failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::EmptyQuestion => Self::InvalidQuestion(value.to_string()),
            other => Self::Generation(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            ApplicationError::Conflict(message) => Self::BadRequest { message, correlation_id },
            ApplicationError::NotFound(message) => Self::NotFound { message, correlation_id },
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{
        ApplicationError, ConnectivityTarget, DomainError, ExecutionFailure, ExecutionFailureKind,
        InterfaceError, PipelineError,
    };

    #[test]
    fn domain_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(DomainError::EmptyQuestion).into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
    }

    #[test]
    fn bad_request_has_user_safe_message() {
        let interface = ApplicationError::Conflict("session already exists".to_owned())
            .into_interface("req-2");

        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn missing_session_maps_to_not_found() {
        let interface =
            ApplicationError::NotFound("session s-1".to_owned()).into_interface("req-5");

        assert!(matches!(interface, InterfaceError::NotFound { .. }));
        assert_eq!(interface.correlation_id(), "req-5");
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn configuration_error_maps_to_internal() {
        let interface = ApplicationError::Configuration("missing model id".to_owned())
            .into_interface("req-4");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert_eq!(interface.user_message(), "An unexpected internal error occurred.");
    }

    #[test]
    fn error_classes_are_stable() {
        let cases = [
            (PipelineError::InvalidQuestion("empty".to_owned()), "invalid_question"),
            (PipelineError::Generation("no sql".to_owned()), "generation_failure"),
            (
                PipelineError::from(ExecutionFailure::new(
                    ExecutionFailureKind::Syntax,
                    "line 1:8: mismatched input",
                )),
                "execution_syntax",
            ),
            (
                PipelineError::from(ExecutionFailure::new(
                    ExecutionFailureKind::Permission,
                    "access denied",
                )),
                "execution_permission",
            ),
            (
                PipelineError::from(ExecutionFailure::new(
                    ExecutionFailureKind::Timeout,
                    "query exceeded 300s",
                )),
                "execution_timeout",
            ),
            (
                PipelineError::from(ExecutionFailure::new(ExecutionFailureKind::Other, "boom")),
                "execution_failure",
            ),
            (PipelineError::Summarization("empty".to_owned()), "summarization_failure"),
            (
                PipelineError::connectivity(ConnectivityTarget::Model, "connection refused"),
                "connectivity_failure",
            ),
        ];

        for (error, class) in cases {
            assert_eq!(error.error_class(), class);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn connectivity_message_names_the_target() {
        let error = PipelineError::connectivity(ConnectivityTarget::Warehouse, "dns failure");
        assert_eq!(error.to_string(), "warehouse unreachable: dns failure");
    }

    #[test]
    fn empty_question_becomes_invalid_question() {
        let error = PipelineError::from(DomainError::EmptyQuestion);
        assert_eq!(error.error_class(), "invalid_question");
    }
}
