use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tally_core::domain::session::{Exchange, Session, SessionKey};
use tokio::sync::RwLock;

use super::{RepositoryError, SessionRepository};

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn create(
        &self,
        key: SessionKey,
        state: Map<String, Value>,
    ) -> Result<Session, RepositoryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&key) {
            return Err(RepositoryError::Conflict(key.session_id.0));
        }
        let session = Session::new(key.clone(), state);
        sessions.insert(key, session.clone());
        Ok(session)
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, RepositoryError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn list(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>, RepositoryError> {
        let sessions = self.sessions.read().await;
        let mut matching: Vec<Session> = sessions
            .values()
            .filter(|session| session.app_name == app_name && session.user_id == user_id)
            .map(|session| Session { exchanges: Vec::new(), ..session.clone() })
            .collect();
        matching.sort_by(|left, right| {
            right.updated_at.cmp(&left.updated_at).then_with(|| left.id.0.cmp(&right.id.0))
        });
        Ok(matching)
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool, RepositoryError> {
        Ok(self.sessions.write().await.remove(key).is_some())
    }

    async fn append_exchange(
        &self,
        key: &SessionKey,
        exchange: Exchange,
    ) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound(key.session_id.0.clone()))?;
        session.record(exchange);
        Ok(())
    }
}
