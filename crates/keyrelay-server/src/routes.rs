//! HTTP handlers.

use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use metrics::counter;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::health::{self, HealthResponse};
use crate::metrics::{HTTP_REQUESTS_TOTAL, WS_CONNECTIONS_REJECTED_TOTAL};
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{parse_key, query_json, status_json};
use crate::server::AppState;
use crate::websocket::session::run_ws_session;

impl RpcError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidParams { .. } => StatusCode::BAD_REQUEST,
            Self::NotConnected { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Broker { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.to_string(), "code": self.code() });
        (self.status_code(), Json(body)).into_response()
    }
}

fn respond(route: &'static str, result: Result<Value, RpcError>) -> Response {
    let response = match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => {
            debug!(route, error = %err, "request failed");
            err.into_response()
        }
    };
    counter!(HTTP_REQUESTS_TOTAL, "route" => route, "status" => response.status().as_u16().to_string())
        .increment(1);
    response
}

/// GET /
pub async fn banner() -> &'static str {
    "keyrelay: broker relay is running"
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, &state.relay.stats()))
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

/// POST /publish `{key?, value?}`
pub async fn publish(State(state): State<AppState>, body: Bytes) -> Response {
    respond("/publish", publish_body(&state, &body).await)
}

/// The body is read leniently: a missing or unparsable body, a non-string or
/// empty `key`, or a non-string `value` fall back to the defaults.
async fn publish_body(state: &AppState, body: &[u8]) -> Result<Value, RpcError> {
    let body: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let key = body
        .get("key")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .unwrap_or(state.config.default_publish_key.as_str());
    let key = parse_key(key)?;
    let value = body
        .get("value")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    state.relay.publish(&key, Bytes::from(value)).await?;
    Ok(json!({ "ok": true }))
}

/// Query string of `GET /query`.
#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    /// Pattern to query; defaults to the configured query key.
    pub key: Option<String>,
    /// Optional payload sent with the query.
    pub value: Option<String>,
}

/// GET /query?key=&value=
pub async fn query(State(state): State<AppState>, Query(params): Query<QueryParams>) -> Response {
    respond("/query", run_query(&state, params).await)
}

async fn run_query(state: &AppState, params: QueryParams) -> Result<Value, RpcError> {
    let key = params
        .key
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| state.config.default_query_key.clone());
    let pattern = parse_key(&key)?;
    let payload = params.value.map(Bytes::from);
    let outcome = state.relay.query(&pattern, payload).await?;
    Ok(query_json(&outcome))
}

/// POST /connect
pub async fn connect(State(state): State<AppState>) -> Response {
    match state.relay.connect().await {
        Ok(()) => respond("/connect", Ok(status_json(&state.relay.status()))),
        Err(err) => {
            let err = RpcError::from(err);
            warn!(error = %err, "operator connect failed");
            let mut body = status_json(&state.relay.status());
            body["error"] = json!(err.to_string());
            counter!(HTTP_REQUESTS_TOTAL, "route" => "/connect", "status" => err.status_code().as_u16().to_string())
                .increment(1);
            (err.status_code(), Json(body)).into_response()
        }
    }
}

/// GET /ws
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.shutdown.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "server is shutting down" })),
        )
            .into_response();
    }
    let connections = state.relay.stats().channels;
    if connections >= state.config.max_connections {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(
            connections,
            max = state.config.max_connections,
            "connection limit reached, upgrade refused"
        );
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "too many connections" })),
        )
            .into_response();
    }
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, state))
}
