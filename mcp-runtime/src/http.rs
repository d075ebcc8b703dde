use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::{McpServer, RpcError, error_response};

pub(crate) fn router(server: Arc<McpServer>) -> Router {
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

pub(crate) async fn serve(server: Arc<McpServer>, bind: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "serving MCP over HTTP");
    axum::serve(listener, router(server)).await
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn handle_mcp(State(server): State<Arc<McpServer>>, body: Bytes) -> Response {
    let incoming: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            let payload = error_response(
                Value::Null,
                RpcError::parse_error(format!("Invalid JSON payload: {err}")),
            );
            return (StatusCode::BAD_REQUEST, Json(payload)).into_response();
        }
    };
    let is_batch = incoming.is_array();
    let mut responses = server.handle_incoming_message(incoming).await;

    if responses.is_empty() {
        return StatusCode::ACCEPTED.into_response();
    }
    if is_batch {
        return Json(Value::Array(responses)).into_response();
    }
    Json(responses.remove(0)).into_response()
}
