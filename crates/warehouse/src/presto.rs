use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tally_core::config::WarehouseConfig;
use tally_core::domain::result_set::{Column, ResultSet};
use tracing::{debug, warn};

use crate::error::{QueryErrorBody, WarehouseError};
use crate::Warehouse;

const SOURCE: &str = "tally";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Presto REST client: `POST /v1/statement`, then follow `nextUri` until the
/// coordinator stops returning one.
#[derive(Clone)]
pub struct PrestoClient {
    http: Client,
    endpoint: String,
    catalog: String,
    database: String,
    user: String,
    credentials: Option<(String, SecretString)>,
    session: Option<String>,
    query_timeout: Duration,
    poll_interval: Duration,
}

/// Cancels the running query on the coordinator when dropped while a
/// `nextUri` is outstanding. Polling stops on the query deadline or when the
/// caller abandons the run; without this the coordinator keeps executing.
struct PendingQuery {
    client: PrestoClient,
    next_uri: Option<String>,
}

impl Drop for PendingQuery {
    fn drop(&mut self) {
        let Some(uri) = self.next_uri.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let request = self.client.decorate(self.client.http.delete(self.client.absolute(&uri)));
        runtime.spawn(async move {
            match request.send().await {
                Ok(response) => debug!(
                    event_name = "warehouse.query.cancelled",
                    status = response.status().as_u16(),
                    "presto query cancelled"
                ),
                Err(error) => warn!(
                    event_name = "warehouse.query.cancel_failed",
                    error = %error,
                    "presto query could not be cancelled"
                ),
            }
        });
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResults {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    next_uri: Option<String>,
    #[serde(default)]
    columns: Option<Vec<PrestoColumn>>,
    #[serde(default)]
    data: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    error: Option<QueryErrorBody>,
}

#[derive(Debug, Deserialize)]
struct PrestoColumn {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

impl PrestoClient {
    pub fn from_config(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .build()
            .map_err(|error| WarehouseError::Transport(error.to_string()))?;

        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                Some((access_key.expose_secret().to_owned(), secret_key.clone()))
            }
            _ => None,
        };

        Ok(Self {
            http,
            endpoint: config.endpoint.trim().trim_end_matches('/').to_owned(),
            catalog: config.catalog.clone(),
            database: config.database.clone(),
            user: config.user.clone(),
            credentials,
            session: config.session_header(),
            query_timeout: Duration::from_secs(config.query_timeout_secs),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn decorate(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request
            .header("X-Presto-User", &self.user)
            .header("X-Presto-Catalog", &self.catalog)
            .header("X-Presto-Schema", &self.database)
            .header("X-Presto-Source", SOURCE);
        if let Some(session) = &self.session {
            request = request.header("X-Presto-Session", session);
        }
        if let Some((access_key, secret_key)) = &self.credentials {
            request = request.basic_auth(access_key, Some(secret_key.expose_secret()));
        }
        request
    }

    fn absolute(&self, uri: &str) -> String {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            uri.to_owned()
        } else {
            format!("{}/{}", self.endpoint, uri.trim_start_matches('/'))
        }
    }

    async fn read_page(response: reqwest::Response) -> Result<QueryResults, WarehouseError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WarehouseError::Http { status: status.as_u16(), body });
        }
        Ok(response.json::<QueryResults>().await?)
    }

    async fn run(&self, sql: &str) -> Result<ResultSet, WarehouseError> {
        let request = self
            .http
            .post(format!("{}/v1/statement", self.endpoint))
            .header("Content-Type", "text/plain")
            .body(sql.to_owned());
        let mut page = Self::read_page(self.decorate(request).send().await?).await?;
        debug!(
            event_name = "warehouse.query.submitted",
            query_id = page.id.as_deref().unwrap_or("unknown"),
            "presto statement accepted"
        );

        let mut pending = PendingQuery { client: self.clone(), next_uri: None };
        let mut columns: Option<Vec<Column>> = None;
        let mut rows: Vec<Vec<Value>> = Vec::new();

        loop {
            if let Some(error) = page.error.take() {
                pending.next_uri = None;
                return Err(error.into_error());
            }
            if columns.is_none() {
                columns = page.columns.take().map(|columns| {
                    columns
                        .into_iter()
                        .map(|column| Column::new(column.name, column.column_type))
                        .collect()
                });
            }
            let page_had_data = match page.data.take() {
                Some(data) => {
                    rows.extend(data);
                    true
                }
                None => false,
            };

            pending.next_uri = page.next_uri.take();
            let Some(next_uri) = pending.next_uri.clone() else {
                break;
            };
            if !page_had_data {
                tokio::time::sleep(self.poll_interval).await;
            }
            let request = self.http.get(self.absolute(&next_uri));
            page = Self::read_page(self.decorate(request).send().await?).await?;
        }

        ResultSet::new(columns.unwrap_or_default(), rows)
            .map_err(|error| WarehouseError::Protocol(error.to_string()))
    }
}

#[async_trait]
impl Warehouse for PrestoClient {
    fn catalog(&self) -> &str {
        &self.catalog
    }

    fn database(&self) -> &str {
        &self.database
    }

    async fn execute(&self, sql: &str) -> Result<ResultSet, WarehouseError> {
        match tokio::time::timeout(self.query_timeout, self.run(sql)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    event_name = "warehouse.query.deadline_exceeded",
                    timeout_secs = self.query_timeout.as_secs(),
                    "presto query cancelled after deadline"
                );
                Err(WarehouseError::Deadline(self.query_timeout.as_secs()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tally_core::config::WarehouseConfig;
    use tally_core::errors::ExecutionFailureKind;

    use super::PrestoClient;
    use crate::{Warehouse, WarehouseError};

    #[derive(Clone, Default)]
    struct Coordinator {
        address: Arc<Mutex<Option<SocketAddr>>>,
        seen_headers: Arc<Mutex<Vec<BTreeMap<String, String>>>>,
        cancelled: Arc<Mutex<Vec<String>>>,
    }

    impl Coordinator {
        fn cancelled(&self) -> Vec<String> {
            self.cancelled.lock().map(|cancelled| cancelled.clone()).unwrap_or_default()
        }

        async fn wait_for_cancel(&self) -> Vec<String> {
            for _ in 0..100 {
                let cancelled = self.cancelled();
                if !cancelled.is_empty() {
                    return cancelled;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Vec::new()
        }

        fn base(&self) -> String {
            let address = self.address.lock().ok().and_then(|address| *address);
            address.map(|address| format!("http://{address}")).unwrap_or_default()
        }
    }

    async fn submit(
        State(coordinator): State<Coordinator>,
        headers: HeaderMap,
        sql: String,
    ) -> (StatusCode, Json<Value>) {
        let captured = headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-presto-"))
            .map(|(name, value)| {
                (name.as_str().to_owned(), value.to_str().unwrap_or_default().to_owned())
            })
            .collect();
        if let Ok(mut seen) = coordinator.seen_headers.lock() {
            seen.push(captured);
        }

        if headers.get("x-presto-user").and_then(|value| value.to_str().ok()) == Some("intruder")
        {
            return (StatusCode::UNAUTHORIZED, Json(json!({"message": "unauthorized"})));
        }

        let base = coordinator.base();
        let body = if sql.contains("\"Missing\"") {
            json!({
                "id": "q-missing",
                "error": {
                    "message": "line 1:15: Table hive_catalog.test_db.Missing does not exist",
                    "errorCode": 46,
                    "errorName": "TABLE_NOT_FOUND",
                    "errorType": "USER_ERROR"
                }
            })
        } else if sql.contains("sleep_forever") {
            json!({"id": "q-slow", "nextUri": format!("{base}/v1/statement/q-slow/1")})
        } else {
            json!({"id": "q-accounts", "nextUri": format!("{base}/v1/statement/q-accounts/1")})
        };
        (StatusCode::OK, Json(body))
    }

    async fn page(
        State(coordinator): State<Coordinator>,
        Path((query_id, token)): Path<(String, u32)>,
    ) -> Json<Value> {
        let base = coordinator.base();
        let columns = json!([
            {"name": "Name", "type": "varchar"},
            {"name": "AnnualRevenue", "type": "double"}
        ]);
        let body = match (query_id.as_str(), token) {
            ("q-slow", token) => json!({
                "id": "q-slow",
                "nextUri": format!("{base}/v1/statement/q-slow/{}", token + 1),
            }),
            (_, 1) => json!({
                "id": "q-accounts",
                "columns": columns,
                "data": [["Acme", 1250000.0], ["Globex", null]],
                "nextUri": format!("{base}/v1/statement/q-accounts/2")
            }),
            (_, 2) => json!({"id": "q-accounts", "nextUri": "/v1/statement/q-accounts/3"}),
            _ => json!({
                "id": "q-accounts",
                "columns": columns,
                "data": [["Initech", 98000.5]]
            }),
        };
        Json(body)
    }

    async fn cancel(
        State(coordinator): State<Coordinator>,
        Path((query_id, _token)): Path<(String, u32)>,
    ) -> StatusCode {
        if let Ok(mut cancelled) = coordinator.cancelled.lock() {
            cancelled.push(query_id);
        }
        StatusCode::NO_CONTENT
    }

    async fn spawn_coordinator() -> (Coordinator, String) {
        let coordinator = Coordinator::default();
        let app = Router::new()
            .route("/v1/statement", post(submit))
            .route("/v1/statement/{query_id}/{token}", get(page).delete(cancel))
            .with_state(coordinator.clone());

        let listener =
            tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind fake coordinator");
        let address = listener.local_addr().expect("local address");
        if let Ok(mut slot) = coordinator.address.lock() {
            *slot = Some(address);
        }
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (coordinator, format!("http://{address}"))
    }

    fn config(endpoint: &str) -> WarehouseConfig {
        WarehouseConfig {
            endpoint: endpoint.to_owned(),
            catalog: "hive_catalog".to_owned(),
            database: "test_db".to_owned(),
            user: "tally".to_owned(),
            access_key: None,
            secret_key: None,
            region: "cn-beijing".to_owned(),
            session_properties: BTreeMap::from([(
                "query_engine_type".to_owned(),
                "presto".to_owned(),
            )]),
            timeout_secs: 5,
            query_timeout_secs: 30,
        }
    }

    #[tokio::test]
    async fn execute_collects_all_pages_of_three_row_table() {
        let (coordinator, endpoint) = spawn_coordinator().await;
        let client = PrestoClient::from_config(&config(&endpoint))
            .expect("client")
            .with_poll_interval(Duration::from_millis(1));

        let result = client
            .execute(
                "SELECT \"Name\", \"AnnualRevenue\" FROM \"hive_catalog\".\"test_db\".\"Account\"",
            )
            .await
            .expect("query should succeed");

        assert_eq!(result.row_count(), 3);
        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.get(0, "Name"), Some(&json!("Acme")));
        assert_eq!(result.get(1, "AnnualRevenue"), Some(&json!(null)));
        assert_eq!(result.get(2, "Name"), Some(&json!("Initech")));

        let seen = coordinator.seen_headers.lock().map(|seen| seen.clone()).unwrap_or_default();
        let first = seen.first().cloned().unwrap_or_default();
        assert_eq!(first.get("x-presto-catalog").map(String::as_str), Some("hive_catalog"));
        assert_eq!(first.get("x-presto-schema").map(String::as_str), Some("test_db"));
        assert_eq!(
            first.get("x-presto-session").map(String::as_str),
            Some("query_engine_type=presto")
        );
    }

    #[tokio::test]
    async fn missing_table_is_syntax_failure() {
        let (_coordinator, endpoint) = spawn_coordinator().await;
        let client = PrestoClient::from_config(&config(&endpoint)).expect("client");

        let error = client
            .execute("SELECT * FROM \"hive_catalog\".\"test_db\".\"Missing\"")
            .await
            .expect_err("missing table should fail");

        assert_eq!(error.failure_kind(), Some(ExecutionFailureKind::Syntax));
        assert!(error.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn rejected_credentials_are_permission_failure() {
        let (_coordinator, endpoint) = spawn_coordinator().await;
        let mut settings = config(&endpoint);
        settings.user = "intruder".to_owned();
        settings.access_key = Some(SecretString::from("AKLT-test".to_owned()));
        settings.secret_key = Some(SecretString::from("secret".to_owned()));
        let client = PrestoClient::from_config(&settings).expect("client");

        let error = client.execute("SELECT 1").await.expect_err("401 should fail");
        assert!(matches!(error, WarehouseError::Http { status: 401, .. }));
        assert_eq!(error.failure_kind(), Some(ExecutionFailureKind::Permission));
    }

    #[tokio::test]
    async fn polling_stops_at_query_deadline() {
        let (coordinator, endpoint) = spawn_coordinator().await;
        let client = PrestoClient::from_config(&config(&endpoint))
            .expect("client")
            .with_query_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(10));

        let error = client.execute("SELECT sleep_forever()").await.expect_err("deadline");
        assert!(matches!(error, WarehouseError::Deadline(_)));
        assert_eq!(error.failure_kind(), Some(ExecutionFailureKind::Timeout));
        assert_eq!(coordinator.wait_for_cancel().await, vec!["q-slow".to_owned()]);
    }

    #[tokio::test]
    async fn abandoned_query_is_cancelled_on_coordinator() {
        let (coordinator, endpoint) = spawn_coordinator().await;
        let client = PrestoClient::from_config(&config(&endpoint))
            .expect("client")
            .with_poll_interval(Duration::from_millis(10));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            client.execute("SELECT sleep_forever()"),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(coordinator.wait_for_cancel().await, vec!["q-slow".to_owned()]);
    }

    #[tokio::test]
    async fn finished_and_failed_queries_are_not_cancelled() {
        let (coordinator, endpoint) = spawn_coordinator().await;
        let client = PrestoClient::from_config(&config(&endpoint))
            .expect("client")
            .with_poll_interval(Duration::from_millis(1));

        client.execute("SELECT 1").await.expect("query should succeed");
        client
            .execute("SELECT * FROM \"hive_catalog\".\"test_db\".\"Missing\"")
            .await
            .expect_err("missing table");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(coordinator.cancelled().is_empty());
    }

    #[tokio::test]
    async fn unreachable_coordinator_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
        let address = listener.local_addr().expect("address");
        drop(listener);

        let client =
            PrestoClient::from_config(&config(&format!("http://{address}"))).expect("client");
        let error = client.execute("SELECT 1").await.expect_err("nothing is listening");

        assert!(matches!(error, WarehouseError::Transport(_)));
        assert_eq!(error.failure_kind(), None);
    }
}
