//! Inbound frame dispatch: parse as [`RpcRequest`] and route through the
//! [`MethodRegistry`].

use tracing::{debug, error, instrument, warn};

use crate::rpc::context::RpcContext;
use crate::rpc::errors;
use crate::rpc::registry::MethodRegistry;
use crate::rpc::types::{RpcRequest, RpcResponse};

/// Handle one inbound text frame and return the serialized response.
#[instrument(skip_all, fields(method))]
pub async fn handle_message(message: &str, registry: &MethodRegistry, ctx: &RpcContext) -> String {
    let response = match serde_json::from_str::<RpcRequest>(message) {
        Ok(request) => {
            let _ = tracing::Span::current().record("method", request.method.as_str());
            debug!(method = %request.method, id = %request.id, "dispatching RPC");
            registry.dispatch(request, ctx).await
        }
        Err(e) => {
            warn!(error = %e, "invalid request frame");
            RpcResponse::error("unknown", errors::INVALID_PARAMS, format!("Invalid JSON: {e}"))
        }
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        error!(error = %e, "failed to serialize response");
        String::new()
    })
}
