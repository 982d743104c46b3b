use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tally_db::repositories::SessionRepository;

#[derive(Clone)]
pub struct HealthState {
    sessions: Arc<dyn SessionRepository>,
}

impl HealthState {
    pub fn new(sessions: Arc<dyn SessionRepository>) -> Self {
        Self { sessions }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub session_store: HealthCheck,
    pub checked_at: String,
}

pub fn router(sessions: Arc<dyn SessionRepository>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState::new(sessions))
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let session_store = session_store_check(state.sessions.as_ref()).await;
    let ready = session_store.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "tally-server runtime initialized".to_string(),
        },
        session_store,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn session_store_check(sessions: &dyn SessionRepository) -> HealthCheck {
    match sessions.ping().await {
        Ok(()) => HealthCheck { status: "ready", detail: "session store reachable".to_string() },
        Err(error) => HealthCheck {
            status: "degraded",
            detail: format!("session store check failed: {error}"),
        },
    }
}
