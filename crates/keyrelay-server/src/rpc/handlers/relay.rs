//! Relay handlers: subscribe, unsubscribe, publish, query, status, connect.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::handlers::{opt_string_param, parse_key, query_json, require_string_param, status_json};
use crate::rpc::registry::MethodHandler;

/// Point the caller's channel at `pattern`, replacing its previous one.
pub struct SubscribeHandler;

#[async_trait]
impl MethodHandler for SubscribeHandler {
    #[instrument(skip(self, ctx), fields(method = "relay.subscribe", channel = %ctx.channel))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let pattern = parse_key(&require_string_param(params.as_ref(), "pattern")?)?;
        ctx.relay.subscribe(&ctx.channel, &pattern).await?;
        Ok(json!({ "pattern": pattern.as_str() }))
    }
}

/// Drop the caller's pattern.
pub struct UnsubscribeHandler;

#[async_trait]
impl MethodHandler for UnsubscribeHandler {
    #[instrument(skip(self, ctx), fields(method = "relay.unsubscribe", channel = %ctx.channel))]
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let previous = ctx.relay.unsubscribe(&ctx.channel).await?;
        Ok(json!({ "pattern": previous.as_ref().map(|p| p.as_str()) }))
    }
}

/// Publish a value. `key` defaults to the configured publish key.
pub struct PublishHandler;

#[async_trait]
impl MethodHandler for PublishHandler {
    #[instrument(skip(self, ctx), fields(method = "relay.publish"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let key = opt_string_param(params.as_ref(), "key")?
            .unwrap_or_else(|| ctx.config.default_publish_key.clone());
        let key = parse_key(&key)?;
        let value = opt_string_param(params.as_ref(), "value")?.unwrap_or_default();
        ctx.relay.publish(&key, Bytes::from(value)).await?;
        Ok(json!({ "ok": true, "key": key.as_str() }))
    }
}

/// Query the broker. `key` defaults to the configured query pattern.
pub struct QueryHandler;

#[async_trait]
impl MethodHandler for QueryHandler {
    #[instrument(skip(self, ctx), fields(method = "relay.query"))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let key = opt_string_param(params.as_ref(), "key")?
            .unwrap_or_else(|| ctx.config.default_query_key.clone());
        let pattern = parse_key(&key)?;
        let payload = opt_string_param(params.as_ref(), "value")?.map(Bytes::from);
        let outcome = ctx.relay.query(&pattern, payload).await?;
        Ok(query_json(&outcome))
    }
}

/// Session status plus the caller's own pattern.
pub struct StatusHandler;

#[async_trait]
impl MethodHandler for StatusHandler {
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let mut result = status_json(&ctx.relay.status());
        let stats = ctx.relay.stats();
        result["channels"] = json!(stats.channels);
        result["patterns"] = json!(stats.patterns);
        result["pattern"] = json!(ctx.relay.pattern_of(&ctx.channel).as_ref().map(|p| p.as_str()));
        Ok(result)
    }
}

/// Connect to the configured broker. A no-op when already connected.
pub struct ConnectHandler;

#[async_trait]
impl MethodHandler for ConnectHandler {
    #[instrument(skip(self, ctx), fields(method = "relay.connect"))]
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        ctx.relay.connect().await?;
        Ok(status_json(&ctx.relay.status()))
    }
}
