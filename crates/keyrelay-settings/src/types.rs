//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may contain any subset of fields; missing fields keep their compiled
//! default.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 4000 },
///   "broker": { "locator": "mem://lab", "responseTimeoutMs": 5000 },
///   "relay": { "defaultSubscription": "sensors/**" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeyRelaySettings {
    /// HTTP and WebSocket listener.
    pub server: ServerSettings,
    /// Upstream broker session.
    pub broker: BrokerSettings,
    /// Fan-out and query behavior.
    pub relay: RelaySettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl KeyRelaySettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(invalid("server.maxConnections must be at least 1"));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(invalid("server.heartbeatIntervalSecs must be at least 1"));
        }
        if self.server.heartbeat_timeout_secs <= self.server.heartbeat_interval_secs {
            return Err(invalid(
                "server.heartbeatTimeoutSecs must exceed server.heartbeatIntervalSecs",
            ));
        }
        if self.broker.locator.trim().is_empty() {
            return Err(invalid("broker.locator must not be empty"));
        }
        if self.broker.response_timeout_ms == 0 {
            return Err(invalid("broker.responseTimeoutMs must be at least 1"));
        }
        if self.relay.outbox_capacity == 0 {
            return Err(invalid("relay.outboxCapacity must be at least 1"));
        }
        if self.relay.max_query_replies == 0 {
            return Err(invalid("relay.maxQueryReplies must be at least 1"));
        }
        if let Some(pattern) = &self.relay.default_subscription {
            check_key_expr("relay.defaultSubscription", pattern, false)?;
        }
        check_key_expr("relay.defaultPublishKey", &self.relay.default_publish_key, true)?;
        check_key_expr("relay.defaultQueryKey", &self.relay.default_query_key, false)?;
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}

fn check_key_expr(field: &str, value: &str, concrete: bool) -> Result<()> {
    let parsed = if concrete {
        keyrelay_core::KeyExpr::concrete(value)
    } else {
        keyrelay_core::KeyExpr::new(value)
    };
    parsed
        .map(|_| ())
        .map_err(|e| SettingsError::InvalidValue(format!("{field}: {e}")))
}

/// HTTP/WebSocket listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks an ephemeral port).
    pub port: u16,
    /// Origin allowed by CORS.
    pub client_origin: String,
    /// Maximum concurrent WebSocket channels.
    pub max_connections: usize,
    /// Ping interval for WebSocket channels.
    pub heartbeat_interval_secs: u64,
    /// A channel silent for this long is disconnected.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted WebSocket frame, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3005,
            client_origin: "http://localhost:3000".to_string(),
            max_connections: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Upstream broker session settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// Broker endpoint address, passed opaquely to the connector.
    pub locator: String,
    /// Bound on connect attempts and on query reply collection.
    pub response_timeout_ms: u64,
    /// Connect during startup. A failure is logged, not fatal.
    pub connect_on_start: bool,
    /// Let publish/query attempt a connect when no session is live.
    pub connect_on_demand: bool,
    /// Whether the in-process broker keeps the latest value per key and
    /// answers queries from it.
    pub storage: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            locator: "mem://local".to_string(),
            response_timeout_ms: 10_000,
            connect_on_start: true,
            connect_on_demand: false,
            storage: true,
        }
    }
}

/// Fan-out and query settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Per-channel outbound buffer, in events.
    pub outbox_capacity: usize,
    /// Dropped deliveries tolerated before a channel is disconnected.
    pub max_dropped_events: u64,
    /// Pattern every new channel starts subscribed to. An empty string in
    /// the settings file disables it.
    pub default_subscription: Option<String>,
    /// Key used by `POST /publish` when the body omits one.
    pub default_publish_key: String,
    /// Pattern used by `GET /query` when the request omits one.
    pub default_query_key: String,
    /// Upper bound on replies collected per query.
    pub max_query_replies: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            outbox_capacity: 1024,
            max_dropped_events: 100,
            default_subscription: Some("test/**".to_string()),
            default_publish_key: "test/cmd".to_string(),
            default_query_key: "test/**".to_string(),
            max_query_replies: 1000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = KeyRelaySettings::default();
        assert_eq!(s.server.port, 3005);
        assert_eq!(s.server.client_origin, "http://localhost:3000");
        assert_eq!(s.broker.response_timeout_ms, 10_000);
        assert_eq!(s.relay.default_subscription.as_deref(), Some("test/**"));
        assert_eq!(s.relay.default_publish_key, "test/cmd");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn camel_case_wire_format() {
        let json = serde_json::to_value(KeyRelaySettings::default()).unwrap();
        assert_eq!(json["server"]["clientOrigin"], "http://localhost:3000");
        assert_eq!(json["broker"]["responseTimeoutMs"], 10_000);
        assert_eq!(json["relay"]["maxDroppedEvents"], 100);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: KeyRelaySettings =
            serde_json::from_str(r#"{"relay": {"outboxCapacity": 8}}"#).unwrap();
        assert_eq!(s.relay.outbox_capacity, 8);
        assert_eq!(s.relay.max_query_replies, 1000);
        assert_eq!(s.server.port, 3005);
    }

    #[test]
    fn null_default_subscription_disables_it() {
        let s: KeyRelaySettings =
            serde_json::from_str(r#"{"relay": {"defaultSubscription": null}}"#).unwrap();
        assert!(s.relay.default_subscription.is_none());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_outbox() {
        let mut s = KeyRelaySettings::default();
        s.relay.outbox_capacity = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_timeout_below_interval() {
        let mut s = KeyRelaySettings::default();
        s.server.heartbeat_timeout_secs = 10;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_wild_publish_key() {
        let mut s = KeyRelaySettings::default();
        s.relay.default_publish_key = "test/*".to_string();
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("relay.defaultPublishKey"));
    }

    #[test]
    fn validate_rejects_malformed_subscription() {
        let mut s = KeyRelaySettings::default();
        s.relay.default_subscription = Some("test//x".to_string());
        assert!(s.validate().is_err());
    }
}
