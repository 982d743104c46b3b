use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::answer::Answer;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifies a session the way HTTP routes address it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: SessionId,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: SessionId,
    ) -> Self {
        Self { app_name: app_name.into(), user_id: user_id.into(), session_id }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub question: String,
    pub sql: String,
    pub answer: Answer,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub app_name: String,
    pub user_id: String,
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(key: SessionKey, state: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: key.session_id,
            app_name: key.app_name,
            user_id: key.user_id,
            state,
            exchanges: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.app_name.clone(), self.user_id.clone(), self.id.clone())
    }

    pub fn record(&mut self, exchange: Exchange) {
        self.updated_at = exchange.recorded_at;
        self.exchanges.push(exchange);
    }

    /// The most recent `turns` exchanges, oldest first.
    pub fn recent_exchanges(&self, turns: usize) -> &[Exchange] {
        let start = self.exchanges.len().saturating_sub(turns);
        &self.exchanges[start..]
    }
}
