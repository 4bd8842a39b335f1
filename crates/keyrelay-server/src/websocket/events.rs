//! Event frames pushed to WebSocket clients.

use keyrelay_core::ChannelId;
use keyrelay_relay::ChannelEvent;
use serde_json::json;
use tracing::error;

use crate::rpc::types::RpcEvent;

/// Sent once, first, on every new connection.
pub const CONNECTION_ESTABLISHED: &str = "connection.established";
/// Broker session state, on connect and on every change.
pub const RELAY_STATUS: &str = "relay.status";
/// A sample matching the client's pattern.
pub const RELAY_SAMPLE: &str = "relay.sample";

/// `connection.established {clientId}`.
pub fn connection_established(channel: &ChannelId) -> RpcEvent {
    RpcEvent::new(CONNECTION_ESTABLISHED, json!({ "clientId": channel.as_str() }))
}

/// Wire frame for a relay event.
///
/// Payloads are sent as text; invalid UTF-8 is replaced.
pub fn from_channel_event(event: &ChannelEvent) -> RpcEvent {
    match event {
        ChannelEvent::SampleReceived {
            key,
            payload,
            timestamp,
        } => RpcEvent::new(
            RELAY_SAMPLE,
            json!({
                "key": key.as_str(),
                "value": String::from_utf8_lossy(payload),
                "timestamp": timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            }),
        ),
        ChannelEvent::StatusChanged { state, reason } => {
            let mut data = json!({ "status": state.as_str() });
            if let Some(reason) = reason {
                data["reason"] = json!(reason);
            }
            RpcEvent::new(RELAY_STATUS, data)
        }
    }
}

/// Serialize a frame, logging (and skipping) the rare failure.
pub fn to_text(event: &RpcEvent) -> Option<String> {
    serde_json::to_string(event)
        .map_err(|e| error!(error = %e, event_type = %event.event_type, "failed to serialize event"))
        .ok()
}
