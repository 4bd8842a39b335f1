//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use keyrelay_relay::ChannelEvent;
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::events;
use super::handler::handle_message;
use super::heartbeat::Liveness;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::rpc::context::RpcContext;
use crate::rpc::types::RpcEvent;
use crate::server::AppState;

/// Queued RPC responses per connection.
const RESPONSE_BUFFER: usize = 64;

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame or the stream ended.
    ClientClosed,
    /// Nothing was heard from the client within the heartbeat timeout.
    Unresponsive,
    /// The relay closed the channel's outbox (too slow, or relay shutdown).
    OutboxClosed,
    /// The server is shutting down.
    Shutdown,
    /// Writing to the socket failed.
    SendFailed,
}

impl CloseReason {
    /// Metric/log label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Unresponsive => "unresponsive",
            Self::OutboxClosed => "outbox_closed",
            Self::Shutdown => "shutdown",
            Self::SendFailed => "send_failed",
        }
    }
}

/// Run a session for a freshly upgraded socket.
///
/// The client is registered with the relay as a channel and first receives
/// `connection.established`, then the current `relay.status`. Text frames
/// are dispatched as RPC requests; relay events and responses are written by
/// a separate task that also pings the client. When either side finishes,
/// the channel is disconnected from the relay, releasing its pattern.
#[instrument(skip_all, fields(client_id))]
pub async fn run_ws_session(ws: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (channel, outbox) = state.relay.connect_channel().await;
    let client_id = channel.id().clone();
    let _ = tracing::Span::current().record("client_id", client_id.as_str());

    let started = Instant::now();
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!("client connected");

    let established = send_event(&mut ws_tx, &events::connection_established(&client_id)).await;

    let reason = if established {
        let ctx = RpcContext {
            relay: Arc::clone(&state.relay),
            channel: client_id.clone(),
            config: Arc::clone(&state.config),
        };
        let liveness = Arc::new(Liveness::new(state.config.heartbeat_timeout));
        let (resp_tx, resp_rx) = mpsc::channel::<String>(RESPONSE_BUFFER);

        let mut outbound = tokio::spawn(pump_outbound(
            ws_tx,
            outbox,
            resp_rx,
            Arc::clone(&liveness),
            state.config.heartbeat_interval,
            state.shutdown.token(),
        ));

        let reason = loop {
            tokio::select! {
                frame = ws_rx.next() => {
                    let Some(Ok(msg)) = frame else {
                        break CloseReason::ClientClosed;
                    };
                    liveness.mark_alive();
                    let response = match &msg {
                        Message::Text(text) => handle_message(text.as_str(), &state.registry, &ctx).await,
                        Message::Binary(data) => {
                            let Ok(text) = std::str::from_utf8(data) else {
                                debug!(len = data.len(), "ignoring non-UTF-8 binary frame");
                                continue;
                            };
                            handle_message(text, &state.registry, &ctx).await
                        }
                        Message::Close(_) => break CloseReason::ClientClosed,
                        Message::Ping(_) | Message::Pong(_) => continue,
                    };
                    if resp_tx.try_send(response).is_err() {
                        warn!("response queue full, response dropped");
                    }
                }
                finished = &mut outbound => {
                    break finished.unwrap_or(CloseReason::SendFailed);
                }
            }
        };
        outbound.abort();
        reason
    } else {
        CloseReason::SendFailed
    };

    let _ = state.relay.disconnect_channel(&client_id).await;
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(
        reason = reason.as_str(),
        delivered = channel.delivered_count(),
        dropped = channel.dropped_count(),
        "client disconnected"
    );
}

/// Write relay events and RPC responses to the socket, pinging every
/// `ping_interval`.
async fn pump_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<Arc<ChannelEvent>>,
    mut responses: mpsc::Receiver<String>,
    liveness: Arc<Liveness>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) -> CloseReason {
    let mut ping = tokio::time::interval(ping_interval);
    // the first tick completes immediately
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            response = responses.recv() => {
                let Some(text) = response else {
                    return CloseReason::ClientClosed;
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    return CloseReason::SendFailed;
                }
            }
            event = outbox.recv() => {
                let Some(event) = event else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return CloseReason::OutboxClosed;
                };
                if !send_event(&mut ws_tx, &events::from_channel_event(&event)).await {
                    return CloseReason::SendFailed;
                }
            }
            _ = ping.tick() => {
                if liveness.is_expired() {
                    warn!(idle = ?liveness.idle(), "client unresponsive, disconnecting");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return CloseReason::Unresponsive;
                }
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    return CloseReason::SendFailed;
                }
            }
            () = shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return CloseReason::Shutdown;
            }
        }
    }
}

/// Serialize and send one event. Returns `false` if the socket is gone.
async fn send_event(ws_tx: &mut SplitSink<WebSocket, Message>, event: &RpcEvent) -> bool {
    match events::to_text(event) {
        Some(text) => ws_tx.send(Message::Text(text.into())).await.is_ok(),
        None => true,
    }
}
