//! Method registry and async dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{error, warn};

use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUEST_DURATION_SECONDS, RPC_REQUESTS_TOTAL};
use crate::rpc::context::RpcContext;
use crate::rpc::errors::{self, RpcError};
use crate::rpc::types::{RpcRequest, RpcResponse};

/// Trait implemented by every RPC method handler.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given params and context.
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError>;
}

/// Registry mapping method names to handlers.
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
    timeout: Duration,
}

impl MethodRegistry {
    /// Default bound on a single handler's run time. Servers derive theirs
    /// from the broker response timeout with [`crate::config::rpc_timeout`].
    pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            timeout: Self::HANDLER_TIMEOUT,
        }
    }

    /// Override the handler timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a handler for a method name.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    /// Dispatch a request to its handler.
    pub async fn dispatch(&self, request: RpcRequest, ctx: &RpcContext) -> RpcResponse {
        let method = request.method.clone();
        counter!(RPC_REQUESTS_TOTAL, "method" => method.clone()).increment(1);

        let Some(handler) = self.handlers.get(&method) else {
            counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "error_type" => "method_not_found")
                .increment(1);
            return RpcResponse::error(
                request.id,
                errors::METHOD_NOT_FOUND,
                format!("Method '{method}' not found"),
            );
        };

        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, handler.handle(request.params, ctx)).await;

        let response = match result {
            Ok(Ok(value)) => RpcResponse::success(request.id, value),
            Ok(Err(err)) => {
                counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "error_type" => err.code())
                    .increment(1);
                RpcResponse {
                    id: request.id,
                    success: false,
                    result: None,
                    error: Some(err.to_error_body()),
                }
            }
            Err(_elapsed) => {
                counter!(RPC_ERRORS_TOTAL, "method" => method.clone(), "error_type" => "timeout")
                    .increment(1);
                error!(method, timeout = ?self.timeout, "RPC handler timed out");
                RpcResponse::error(
                    request.id,
                    errors::INTERNAL_ERROR,
                    format!("Handler for '{method}' timed out"),
                )
            }
        };

        let duration = start.elapsed();
        histogram!(RPC_REQUEST_DURATION_SECONDS, "method" => method.clone())
            .record(duration.as_secs_f64());
        if duration.as_secs() >= 5 {
            warn!(
                method,
                duration_secs = duration.as_secs_f64(),
                "slow RPC request"
            );
        }

        response
    }

    /// All registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use keyrelay_broker::QueryRequest;
    use keyrelay_core::KeyExpr;
    use serde_json::json;

    use super::*;
    use crate::config::rpc_timeout;
    use crate::rpc::handlers::register_all;
    use crate::rpc::handlers::test_helpers::{harness, harness_with_timeout};

    struct EchoHandler;

    #[async_trait]
    impl MethodHandler for EchoHandler {
        async fn handle(&self, params: Option<Value>, _ctx: &RpcContext) -> Result<Value, RpcError> {
            Ok(params.unwrap_or(Value::Null))
        }
    }

    struct FailHandler;

    #[async_trait]
    impl MethodHandler for FailHandler {
        async fn handle(&self, _params: Option<Value>, _ctx: &RpcContext) -> Result<Value, RpcError> {
            Err(RpcError::NotConnected {
                message: "not connected to the broker".into(),
            })
        }
    }

    struct StallHandler;

    #[async_trait]
    impl MethodHandler for StallHandler {
        async fn handle(&self, _params: Option<Value>, _ctx: &RpcContext) -> Result<Value, RpcError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn request(id: &str, method: &str, params: Option<Value>) -> RpcRequest {
        RpcRequest {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    #[tokio::test]
    async fn dispatch_success() {
        let h = harness(false).await;
        let mut reg = MethodRegistry::new();
        reg.register("echo", EchoHandler);

        let resp = reg.dispatch(request("r1", "echo", Some(json!({"x": 1}))), &h.ctx).await;
        assert!(resp.success);
        assert_eq!(resp.id, "r1");
        assert_eq!(resp.result.unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn dispatch_handler_error() {
        let h = harness(false).await;
        let mut reg = MethodRegistry::new();
        reg.register("fail", FailHandler);

        let resp = reg.dispatch(request("r2", "fail", None), &h.ctx).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap().code, errors::NOT_CONNECTED);
    }

    #[tokio::test]
    async fn dispatch_unknown_method() {
        let h = harness(false).await;
        let reg = MethodRegistry::new();

        let resp = reg.dispatch(request("r3", "nope", None), &h.ctx).await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, errors::METHOD_NOT_FOUND);
        assert!(err.message.contains("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_times_out() {
        let h = harness(false).await;
        let mut reg = MethodRegistry::new().with_timeout(Duration::from_secs(1));
        reg.register("stall", StallHandler);

        let resp = reg.dispatch(request("r4", "stall", None), &h.ctx).await;
        assert_eq!(resp.error.unwrap().code, errors::INTERNAL_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn long_response_timeout_query_still_returns_partial_replies() {
        let response_timeout = Duration::from_secs(120);
        let h = harness_with_timeout(true, response_timeout).await;
        let _ = h.broker.declare_queryable(KeyExpr::new("slow").unwrap(), |query: QueryRequest| {
            drop(tokio::spawn(async move {
                let _ = query.replier.reply(KeyExpr::new("slow").unwrap(), "x").await;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }));
        });
        let mut reg = MethodRegistry::new().with_timeout(rpc_timeout(response_timeout));
        register_all(&mut reg);

        let resp = reg
            .dispatch(request("q1", "relay.query", Some(json!({"key": "slow"}))), &h.ctx)
            .await;
        assert!(resp.success, "{:?}", resp.error);
        let result = resp.result.unwrap();
        assert_eq!(result["results"], json!([{"key": "slow", "value": "x"}]));
        assert_eq!(result["complete"], false);
    }

    #[test]
    fn methods_sorted() {
        let mut reg = MethodRegistry::new();
        reg.register("b", EchoHandler);
        reg.register("a", EchoHandler);
        assert_eq!(reg.methods(), vec!["a", "b"]);
        assert!(reg.has_method("a"));
        assert!(!reg.has_method("c"));
    }
}
