//! RPC method handlers.

pub mod relay;

use keyrelay_broker::{QueryOutcome, SessionStatus};
use keyrelay_core::{KeyExpr, Reply};
use serde_json::{Value, json};

use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodRegistry;

/// Register every relay method.
pub fn register_all(registry: &mut MethodRegistry) {
    registry.register("relay.subscribe", relay::SubscribeHandler);
    registry.register("relay.unsubscribe", relay::UnsubscribeHandler);
    registry.register("relay.publish", relay::PublishHandler);
    registry.register("relay.query", relay::QueryHandler);
    registry.register("relay.status", relay::StatusHandler);
    registry.register("relay.connect", relay::ConnectHandler);
}

// ── Param helpers ───────────────────────────────────────────────────

/// Extract a required string parameter.
pub(crate) fn require_string_param(params: Option<&Value>, key: &str) -> Result<String, RpcError> {
    let value = params
        .and_then(|p| p.get(key))
        .ok_or_else(|| RpcError::invalid_params(format!("Missing required parameter: {key}")))?;
    value
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| RpcError::invalid_params(format!("Parameter '{key}' must be a string")))
}

/// Extract an optional string parameter. Empty strings count as absent.
pub(crate) fn opt_string_param(params: Option<&Value>, key: &str) -> Result<Option<String>, RpcError> {
    match params.and_then(|p| p.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RpcError::invalid_params(format!(
            "Parameter '{key}' must be a string"
        ))),
    }
}

/// Parse a key expression, reporting failures as invalid params.
pub(crate) fn parse_key(expr: &str) -> Result<KeyExpr, RpcError> {
    KeyExpr::new(expr).map_err(|e| RpcError::invalid_params(e.to_string()))
}

// ── Shared result shapes ────────────────────────────────────────────

/// `{status, locator, reason}` for a session status.
pub fn status_json(status: &SessionStatus) -> Value {
    json!({
        "status": status.state.as_str(),
        "locator": status.locator,
        "reason": status.reason,
    })
}

/// `{key, value}` for an answer, `{error}` for an error reply.
pub fn reply_json(reply: &Reply) -> Value {
    match reply {
        Reply::Ok { key, payload } => json!({
            "key": key.as_str(),
            "value": String::from_utf8_lossy(payload),
        }),
        Reply::Err { message } => json!({ "error": message }),
    }
}

/// `{results, complete, truncated}` for a finished query.
pub fn query_json(outcome: &QueryOutcome) -> Value {
    json!({
        "results": outcome.replies.iter().map(reply_json).collect::<Vec<_>>(),
        "complete": outcome.is_complete(),
        "truncated": outcome.truncated,
    })
}
