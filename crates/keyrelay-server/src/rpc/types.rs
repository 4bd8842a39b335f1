//! Wire-format types for the WebSocket protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming request frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Client-chosen identifier, echoed in the response.
    pub id: String,
    /// Method name (e.g. `relay.subscribe`).
    pub method: String,
    /// Optional parameters object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Response frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Echoed request identifier.
    pub id: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Result payload (present when `success == true`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload (present when `success == false`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// Error body inside an [`RpcResponse`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Machine-readable code (e.g. `NOT_CONNECTED`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Server-pushed event frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcEvent {
    /// Event type (e.g. `relay.sample`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// RFC 3339 timestamp, millisecond precision.
    pub timestamp: String,
    /// Event payload.
    pub data: Value,
}

impl RpcResponse {
    /// Build a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(RpcErrorBody {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

impl RpcEvent {
    /// Create an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            data,
        }
    }
}
