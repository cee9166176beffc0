//! HTTP API Server
//!
//! REST API over a node: file listings, transfers, deletes, peer status and
//! sync state. Node calls block, so every handler runs them on the blocking
//! pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::node::{CycleReport, Node, TransferOutcome};
use crate::offline::SyncStatus;

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    node: Arc<Node>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, node: Arc<Node>) -> Self {
        Self { config, node }
    }

    /// Create the router
    pub fn router(node: Arc<Node>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/api/files", get(handle_files))
            .route("/api/node_files/:node", get(handle_node_files))
            .route("/api/transfer", post(handle_transfer))
            .route("/api/delete", post(handle_delete))
            .route("/api/status", get(handle_status))
            .route("/api/sync_status", get(handle_sync_status))
            .route("/api/sync", post(handle_sync))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_headers(Any)
                    .allow_methods([Method::GET, Method::POST]),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(node)
    }

    /// Start the HTTP server and serve until the listener fails
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let app = Self::router(Arc::clone(&self.node));
        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))
    }
}

// ============ Request/Response Types ============

/// Transfer request
#[derive(Debug, Deserialize, Serialize)]
pub struct TransferRequest {
    pub filename: Option<String>,
    pub target_node: Option<String>,
}

/// Delete request
#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteRequest {
    pub filename: Option<String>,
}

/// Sync status query
#[derive(Debug, Deserialize)]
pub struct SyncStatusQuery {
    pub filename: Option<String>,
}

/// Generic acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl AckResponse {
    fn ok() -> Self {
        Self {
            status: "ok".into(),
            message: None,
            outcome: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            message: Some(message.into()),
            outcome: None,
        }
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub node: String,
}

/// Sync cycle response
#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub report: CycleReport,
}

/// Either one file's status or the full table
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SyncStatusResponse {
    One(SyncStatus),
    All(BTreeMap<String, SyncStatus>),
}

fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::FileNotFound(_) | Error::UnknownPeer(_) => StatusCode::NOT_FOUND,
        Error::InvalidPath(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Error::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::Remote { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    (error_status(&e), Json(AckResponse::error(e.to_string()))).into_response()
}

/// Run a blocking node call off the async runtime
async fn blocking<T, F>(node: Arc<Node>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Node) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&node))
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {}", e)))?
}

// ============ Handlers ============

async fn handle_health(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        node: node.name().to_string(),
    })
}

async fn handle_files(State(node): State<Arc<Node>>) -> Response {
    match blocking(node, |n| n.list_local()).await {
        Ok(files) => Json(files).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_node_files(State(node): State<Arc<Node>>, Path(peer): Path<String>) -> Response {
    match blocking(node, move |n| n.list_remote(&peer)).await {
        Ok(files) => Json(files).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_transfer(State(node): State<Arc<Node>>, Json(req): Json<TransferRequest>) -> Response {
    let (Some(filename), Some(target)) = (req.filename, req.target_node) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(AckResponse::error("filename and target_node are required")),
        )
            .into_response();
    };

    match blocking(node, move |n| n.transfer(&filename, &target)).await {
        Ok(outcome) => {
            let mut ack = AckResponse::ok();
            ack.outcome = Some(
                match outcome {
                    TransferOutcome::Delivered => "delivered",
                    TransferOutcome::Queued => "queued",
                }
                .to_string(),
            );
            Json(ack).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_delete(State(node): State<Arc<Node>>, Json(req): Json<DeleteRequest>) -> Response {
    let Some(filename) = req.filename else {
        return (StatusCode::BAD_REQUEST, Json(AckResponse::error("filename is required"))).into_response();
    };

    match blocking(node, move |n| n.delete(&filename)).await {
        Ok(true) => Json(AckResponse::ok()).into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, Json(AckResponse::error("file not found"))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_status(State(node): State<Arc<Node>>) -> impl IntoResponse {
    Json(node.info())
}

async fn handle_sync_status(
    State(node): State<Arc<Node>>,
    Query(query): Query<SyncStatusQuery>,
) -> impl IntoResponse {
    match query.filename {
        Some(filename) => Json(SyncStatusResponse::One(node.sync_status(&filename))),
        None => Json(SyncStatusResponse::All(node.all_sync_status())),
    }
}

async fn handle_sync(State(node): State<Arc<Node>>) -> Response {
    match blocking(node, |n| Ok(n.run_cycle())).await {
        Ok(report) => Json(SyncResponse { status: "ok", report }).into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WolfSyncConfig;
    use tempfile::TempDir;

    fn node(dir: &TempDir) -> Arc<Node> {
        let toml = format!(
            r#"
[node]
name = "alpha"
bind_address = "127.0.0.1:0"
shared_dir = "{files}"
data_dir = "{state}"

[peers.alpha]
address = "127.0.0.1"
port = 1

[cluster]
rpc_timeout_ms = 200
max_retries = 1
retry_backoff_ms = 10
"#,
            files = dir.path().join("files").display(),
            state = dir.path().join("state").display(),
        );
        Node::new(WolfSyncConfig::from_str(&toml).unwrap()).unwrap()
    }

    async fn serve(node: Arc<Node>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(ApiConfig::default(), node);
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_and_files() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir);
        node.store().write("a.txt", b"abc").unwrap();
        let base = serve(Arc::clone(&node)).await;
        let client = reqwest::Client::new();

        let health: serde_json::Value = client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(health["node"], "alpha");

        let files: serde_json::Value = client.get(format!("{}/api/files", base)).send().await.unwrap().json().await.unwrap();
        assert_eq!(files[0]["name"], "a.txt");
        assert_eq!(files[0]["size"], 3);
    }

    #[tokio::test]
    async fn test_delete_and_missing_params() {
        let dir = TempDir::new().unwrap();
        let node = node(&dir);
        node.store().write("gone.txt", b"x").unwrap();
        let base = serve(Arc::clone(&node)).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/delete", base))
            .json(&serde_json::json!({"filename": "gone.txt"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert!(!node.store().exists("gone.txt"));

        let resp = client
            .post(format!("{}/api/delete", base))
            .json(&serde_json::json!({"filename": "gone.txt"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let resp = client
            .post(format!("{}/api/transfer", base))
            .json(&serde_json::json!({"filename": "x"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let ack: AckResponse = resp.json().await.unwrap();
        assert_eq!(ack.status, "error");
    }

    #[tokio::test]
    async fn test_sync_status_defaults_to_synced() {
        let dir = TempDir::new().unwrap();
        let base = serve(node(&dir)).await;

        let status: serde_json::Value = reqwest::get(format!("{}/api/sync_status?filename=never.txt", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["synced"], true);
        assert_eq!(status["pending_operations"], false);

        let sync: serde_json::Value = reqwest::Client::new()
            .post(format!("{}/api/sync", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(sync["status"], "ok");
    }
}
