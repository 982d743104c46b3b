pub mod memory;
pub mod session;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tally_core::domain::session::{Exchange, Session, SessionKey};
use tally_core::errors::ApplicationError;
use thiserror::Error;

pub use memory::InMemorySessionRepository;
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("session `{0}` already exists")]
    Conflict(String),
    #[error("session `{0}` not found")]
    NotFound(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Conflict(id) => {
                Self::Conflict(format!("session `{id}` already exists"))
            }
            RepositoryError::NotFound(id) => Self::NotFound(format!("session `{id}` not found")),
            other => Self::Persistence(other.to_string()),
        }
    }
}

/// Durable conversation sessions keyed by app, user and session id.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Fails with [`RepositoryError::Conflict`] when the key is taken.
    async fn create(
        &self,
        key: SessionKey,
        state: Map<String, Value>,
    ) -> Result<Session, RepositoryError>;

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, RepositoryError>;

    /// Sessions for one user, most recently updated first. Exchanges are not loaded.
    async fn list(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>, RepositoryError>;

    /// Returns whether a session was removed.
    async fn delete(&self, key: &SessionKey) -> Result<bool, RepositoryError>;

    async fn append_exchange(
        &self,
        key: &SessionKey,
        exchange: Exchange,
    ) -> Result<(), RepositoryError>;

    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
