//! Server configuration, derived from [`KeyRelaySettings`].

use std::time::Duration;

use keyrelay_core::{KeyExpr, KeyExprError};
use keyrelay_relay::RelayConfig;
use keyrelay_settings::KeyRelaySettings;

use crate::rpc::registry::MethodRegistry;

/// Configuration for the HTTP/WebSocket gateway.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// The single origin allowed by CORS.
    pub client_origin: String,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Silence after which a client is disconnected.
    pub heartbeat_timeout: Duration,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Key used by publishes that name none.
    pub default_publish_key: String,
    /// Pattern used by queries that name none.
    pub default_query_key: String,
    /// Bound on a single RPC handler, see [`rpc_timeout`].
    pub rpc_timeout: Duration,
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &KeyRelaySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            client_origin: server.client_origin.clone(),
            max_connections: server.max_connections,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(server.heartbeat_timeout_secs),
            max_message_size: server.max_message_size,
            default_publish_key: settings.relay.default_publish_key.clone(),
            default_query_key: settings.relay.default_query_key.clone(),
            rpc_timeout: rpc_timeout(Duration::from_millis(settings.broker.response_timeout_ms)),
        }
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    /// Loopback on an ephemeral port, otherwise the settings defaults.
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ..Self::from_settings(&KeyRelaySettings::default())
        }
    }
}

/// Slack added on top of the broker-bound work a handler may wait on.
const RPC_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Handler bound for a broker response timeout.
///
/// A query may first connect on demand and then wait out the full response
/// timeout, so handlers get twice that plus a margin, and never less than
/// [`MethodRegistry::HANDLER_TIMEOUT`].
pub fn rpc_timeout(response_timeout: Duration) -> Duration {
    response_timeout
        .saturating_mul(2)
        .saturating_add(RPC_TIMEOUT_MARGIN)
        .max(MethodRegistry::HANDLER_TIMEOUT)
}

/// Build the relay's configuration from loaded settings.
pub fn relay_config(settings: &KeyRelaySettings) -> Result<RelayConfig, KeyExprError> {
    let default_subscription = settings
        .relay
        .default_subscription
        .as_deref()
        .map(KeyExpr::new)
        .transpose()?;
    Ok(RelayConfig {
        locator: settings.broker.locator.clone(),
        response_timeout: Duration::from_millis(settings.broker.response_timeout_ms),
        connect_on_demand: settings.broker.connect_on_demand,
        outbox_capacity: settings.relay.outbox_capacity,
        max_dropped_events: settings.relay.max_dropped_events,
        default_subscription,
        max_query_replies: settings.relay.max_query_replies,
    })
}
