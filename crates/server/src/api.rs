//! HTTP surface: session CRUD, the blocking `/run` endpoint and the streaming
//! `/run_sse` endpoint.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tally_agent::{PipelineController, RunEvent};
use tally_core::domain::session::{Session, SessionId, SessionKey};
use tally_core::errors::{ApplicationError, InterfaceError};
use tally_db::repositories::RepositoryError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::health;

const EVENT_BUFFER: usize = 32;

#[derive(Clone)]
pub struct ApiState {
    controller: Arc<PipelineController>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub state: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RunRequest {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
    pub question: String,
}

impl RunRequest {
    fn key(&self) -> SessionKey {
        SessionKey::new(&self.app_name, &self.user_id, SessionId(self.session_id.clone()))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    detail: String,
    correlation_id: &'a str,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: Uuid::new_v4().simple().to_string(),
        })
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        Self(error.into_interface(Uuid::new_v4().simple().to_string()))
    }
}

impl From<RepositoryError> for ApiError {
    fn from(error: RepositoryError) -> Self {
        Self::from(ApplicationError::from(error))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(
                event_name = "http.request.failed",
                correlation_id = %self.0.correlation_id(),
                error = %self.0,
                "request failed"
            );
        }
        let body = ErrorBody {
            error: self.0.user_message(),
            detail: self.0.to_string(),
            correlation_id: self.0.correlation_id(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(controller: Arc<PipelineController>, allowed_origins: &[String]) -> Router {
    let sessions = controller.sessions().clone();
    let app = Router::new()
        .route(
            "/apps/{app_name}/users/{user_id}/sessions",
            post(create_session).get(list_sessions),
        )
        .route(
            "/apps/{app_name}/users/{user_id}/sessions/{session_id}",
            post(create_session_with_id).get(get_session).delete(delete_session),
        )
        .route("/run", post(run))
        .route("/run_sse", post(run_sse))
        .with_state(ApiState { controller })
        .merge(health::router(sessions));

    match cors_layer(allowed_origins) {
        Some(cors) => app.layer(cors),
        None => app,
    }
}

/// `*` allows any origin; an empty list disables CORS headers entirely.
fn cors_layer(allowed_origins: &[String]) -> Option<CorsLayer> {
    if allowed_origins.is_empty() {
        return None;
    }
    let origins = if allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::any()
    } else {
        let parsed = allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(
                        event_name = "http.cors.invalid_origin",
                        origin = %origin,
                        "ignoring invalid origin"
                    );
                    None
                }
            })
            .collect::<Vec<_>>();
        AllowOrigin::list(parsed)
    };

    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([CONTENT_TYPE])
            .max_age(Duration::from_secs(600)),
    )
}

async fn create_session(
    State(state): State<ApiState>,
    Path((app_name, user_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Session>, ApiError> {
    let key = SessionKey::new(app_name, user_id, SessionId::generate());
    create(&state, key, &body).await
}

async fn create_session_with_id(
    State(state): State<ApiState>,
    Path((app_name, user_id, session_id)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<Json<Session>, ApiError> {
    let key = SessionKey::new(app_name, user_id, SessionId(session_id));
    create(&state, key, &body).await
}

async fn create(state: &ApiState, key: SessionKey, body: &[u8]) -> Result<Json<Session>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice::<CreateSessionRequest>(body)
            .map_err(|error| ApiError::bad_request(format!("invalid session body: {error}")))?
    };

    let session = state.controller.sessions().create(key, request.state).await?;
    info!(
        event_name = "session.created",
        session_id = %session.id.as_str(),
        app_name = %session.app_name,
        user_id = %session.user_id,
        "session created"
    );
    Ok(Json(session))
}

async fn list_sessions(
    State(state): State<ApiState>,
    Path((app_name, user_id)): Path<(String, String)>,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.controller.sessions().list(&app_name, &user_id).await?))
}

async fn get_session(
    State(state): State<ApiState>,
    Path((app_name, user_id, session_id)): Path<(String, String, String)>,
) -> Result<Json<Session>, ApiError> {
    let key = SessionKey::new(app_name, user_id, SessionId(session_id));
    Ok(Json(state.controller.load_session(&key).await?))
}

async fn delete_session(
    State(state): State<ApiState>,
    Path((app_name, user_id, session_id)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    let key = SessionKey::new(app_name, user_id, SessionId(session_id));
    if state.controller.sessions().delete(&key).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        let message = format!("session `{}` not found", key.session_id.as_str());
        Err(ApplicationError::NotFound(message).into())
    }
}

/// Runs the question to completion and returns every event at once.
async fn run(
    State(state): State<ApiState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<Vec<RunEvent>>, ApiError> {
    let session = state.controller.load_session(&request.key()).await?;
    let (sender, mut receiver) = mpsc::channel(EVENT_BUFFER);

    let collect = async {
        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }
        events
    };
    let (_, events) =
        tokio::join!(state.controller.run(&session, &request.question, sender), collect);

    Ok(Json(events))
}

/// Streams events as they happen. A client that disconnects drops the
/// receiver, which cancels the run.
async fn run_sse(
    State(state): State<ApiState>,
    Json(request): Json<RunRequest>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>> + Send>, ApiError> {
    let session = state.controller.load_session(&request.key()).await?;
    let (sender, receiver) = mpsc::channel(EVENT_BUFFER);

    let controller = state.controller.clone();
    let question = request.question;
    tokio::spawn(async move {
        controller.run(&session, &question, sender).await;
    });

    let stream = ReceiverStream::new(receiver).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event(event.kind()).data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
