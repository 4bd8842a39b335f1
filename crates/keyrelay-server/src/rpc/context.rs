//! Per-connection context handed to every RPC handler.

use std::sync::Arc;

use keyrelay_core::ChannelId;
use keyrelay_relay::Relay;

use crate::config::ServerConfig;

/// What a handler needs: the shared relay, the calling client's channel,
/// and the request defaults.
#[derive(Clone)]
pub struct RpcContext {
    /// Shared relay.
    pub relay: Arc<Relay>,
    /// Channel of the WebSocket connection that sent the request.
    pub channel: ChannelId,
    /// Server configuration (default keys).
    pub config: Arc<ServerConfig>,
}
