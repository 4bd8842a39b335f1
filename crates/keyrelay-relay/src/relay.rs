//! The client-facing relay.
//!
//! [`Relay`] ties the pieces together: channels connect and disconnect
//! through it, pick a pattern with [`Relay::subscribe`], and publish or query
//! through the shared [`SessionManager`]. The relay holds one session-level
//! subscription handle per pattern in use and releases it when the pattern's
//! last holder leaves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use keyrelay_broker::{
    QueryCoordinator, QueryOutcome, SampleCallback, SessionManager, SessionState, SessionStatus,
    SubscriptionHandle,
};
use keyrelay_core::{ChannelId, KeyExpr, Sample};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, ClientChannel, ClientChannelRegistry};
use crate::errors::RelayError;
use crate::fanout::RelayFanout;
use crate::metrics::{
    RELAY_CHANNELS_ACTIVE, RELAY_PATTERNS_ACTIVE, RELAY_PUBLISHES_TOTAL, RELAY_QUERIES_TOTAL,
};
use crate::registry::{Release, SubscriptionRegistry};

/// Relay behavior.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Broker locator used by [`Relay::connect`].
    pub locator: String,
    /// Connect bound and query response timeout.
    pub response_timeout: Duration,
    /// Attempt a connect before publish/query when no session is live.
    pub connect_on_demand: bool,
    /// Per-channel outbox size.
    pub outbox_capacity: usize,
    /// Drops tolerated before a channel is closed.
    pub max_dropped_events: u64,
    /// Pattern applied to every new channel.
    pub default_subscription: Option<KeyExpr>,
    /// Reply limit per query.
    pub max_query_replies: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            locator: "mem://local".to_owned(),
            response_timeout: Duration::from_secs(10),
            connect_on_demand: false,
            outbox_capacity: 1024,
            max_dropped_events: 100,
            default_subscription: KeyExpr::new("test/**").ok(),
            max_query_replies: 1000,
        }
    }
}

/// Point-in-time counters for health reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayStats {
    /// Broker session state.
    pub state: SessionState,
    /// Connected channels.
    pub channels: usize,
    /// Distinct patterns held.
    pub patterns: usize,
}

/// Bridges one broker session to many client channels.
pub struct Relay {
    config: RelayConfig,
    session: SessionManager,
    registry: Arc<RwLock<SubscriptionRegistry>>,
    channels: Arc<ClientChannelRegistry>,
    fanout: RelayFanout,
    queries: QueryCoordinator,
    /// Session handle per pattern in use. Also serializes pattern changes.
    declared: tokio::sync::Mutex<HashMap<KeyExpr, SubscriptionHandle>>,
    /// Channels whose default subscription could not be declared yet.
    pending_default: Mutex<HashSet<ChannelId>>,
    status_task: Mutex<Option<JoinHandle<()>>>,
    /// Set once by [`Relay::shutdown`]; no session or channel opens after.
    closed: AtomicBool,
}

impl Relay {
    /// Build a relay over `session`. Must be called within a Tokio runtime.
    pub fn new(session: SessionManager, config: RelayConfig) -> Arc<Self> {
        let registry = Arc::new(RwLock::new(SubscriptionRegistry::new()));
        let channels = Arc::new(ClientChannelRegistry::new());
        let fanout = RelayFanout::new(Arc::clone(&registry), Arc::clone(&channels));
        let queries = QueryCoordinator::new(session.clone(), config.max_query_replies);
        let status_task = tokio::spawn(forward_status(session.subscribe_status(), fanout.clone()));

        Arc::new(Self {
            config,
            session,
            registry,
            channels,
            fanout,
            queries,
            declared: tokio::sync::Mutex::new(HashMap::new()),
            pending_default: Mutex::new(HashSet::new()),
            status_task: Mutex::new(Some(status_task)),
            closed: AtomicBool::new(false),
        })
    }

    /// The relay's configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// The shared session.
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Whether [`Relay::shutdown`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Channels ────────────────────────────────────────────────────

    /// Register a new channel.
    ///
    /// The channel is sent the current session status and, when configured,
    /// subscribed to the default pattern. If that fails because no session is
    /// live, the next successful [`Relay::connect`] applies it. Returns the
    /// channel and its outbox.
    ///
    /// After shutdown the channel comes back already closed and unregistered.
    pub async fn connect_channel(&self) -> (Arc<ClientChannel>, mpsc::Receiver<Arc<ChannelEvent>>) {
        let (channel, rx) = ClientChannel::new(
            ChannelId::new(),
            self.config.outbox_capacity,
            self.config.max_dropped_events,
        );
        if self.is_closed() {
            let _ = channel.close();
            return (channel, rx);
        }
        self.channels.register(Arc::clone(&channel));
        // shutdown may have drained between the check and the insert
        if self.is_closed() {
            let _ = self.channels.remove(channel.id());
            let _ = channel.close();
            return (channel, rx);
        }
        set_gauge(RELAY_CHANNELS_ACTIVE, self.channels.len());

        let status = self.session.status();
        let _ = channel.deliver(Arc::new(ChannelEvent::StatusChanged {
            state: status.state,
            reason: status.reason,
        }));

        if let Some(pattern) = &self.config.default_subscription {
            if let Err(error) = self.subscribe(channel.id(), pattern).await {
                debug!(channel = %channel.id(), %pattern, %error, "default subscription deferred");
                let _ = self.pending_default.lock().insert(channel.id().clone());
            }
        }

        info!(
            channel = %channel.id(),
            channels = self.channels.len(),
            "channel connected"
        );
        (channel, rx)
    }

    /// Unregister a channel, releasing its pattern. Returns `false` for an
    /// unknown channel.
    pub async fn disconnect_channel(&self, id: &ChannelId) -> bool {
        let Some(channel) = self.channels.remove(id) else {
            return false;
        };
        let _ = channel.close();
        set_gauge(RELAY_CHANNELS_ACTIVE, self.channels.len());
        let _ = self.pending_default.lock().remove(id);

        let mut declared = self.declared.lock().await;
        let released = self.registry.write().release_channel(id);
        if let Some(release) = released {
            self.undeclare_if_unused(&mut declared, release).await;
        }
        info!(
            channel = %id,
            delivered = channel.delivered_count(),
            dropped = channel.dropped_count(),
            age_secs = channel.age().as_secs(),
            "channel disconnected"
        );
        true
    }

    /// Point `channel` at `pattern`, releasing its previous pattern.
    ///
    /// The broker-side subscription for `pattern` is in place before the
    /// channel is mapped to it, and the old mapping is dropped in the same
    /// step, so the channel never sees samples for both patterns.
    pub async fn subscribe(&self, channel: &ChannelId, pattern: &KeyExpr) -> Result<(), RelayError> {
        let mut declared = self.declared.lock().await;
        if !self.channels.contains(channel) {
            return Err(RelayError::UnknownChannel(channel.clone()));
        }
        if self.registry.read().pattern_of(channel) == Some(pattern) {
            return Ok(());
        }

        if !declared.contains_key(pattern) {
            let handle = self
                .session
                .declare_subscription(pattern, self.sample_callback(pattern))
                .await?;
            let _ = declared.insert(pattern.clone(), handle);
        }

        let released = self.registry.write().acquire(channel, pattern);
        let previous = released.as_ref().map(|r| r.pattern.clone());
        if let Some(release) = released {
            self.undeclare_if_unused(&mut declared, release).await;
        }
        set_gauge(RELAY_PATTERNS_ACTIVE, declared.len());
        debug!(
            %channel,
            %pattern,
            previous = previous.as_ref().map(KeyExpr::as_str),
            "channel subscribed"
        );
        Ok(())
    }

    /// Drop `channel`'s pattern. Returns the pattern it held, if any.
    pub async fn unsubscribe(&self, channel: &ChannelId) -> Result<Option<KeyExpr>, RelayError> {
        let mut declared = self.declared.lock().await;
        if !self.channels.contains(channel) {
            return Err(RelayError::UnknownChannel(channel.clone()));
        }
        let released = self.registry.write().release_channel(channel);
        let Some(release) = released else {
            return Ok(None);
        };
        let pattern = release.pattern.clone();
        self.undeclare_if_unused(&mut declared, release).await;
        set_gauge(RELAY_PATTERNS_ACTIVE, declared.len());
        debug!(%channel, %pattern, "channel unsubscribed");
        Ok(Some(pattern))
    }

    /// The pattern `channel` currently holds.
    pub fn pattern_of(&self, channel: &ChannelId) -> Option<KeyExpr> {
        self.registry.read().pattern_of(channel).cloned()
    }

    /// Number of channels holding `pattern`.
    pub fn refcount(&self, pattern: &KeyExpr) -> usize {
        self.registry.read().refcount(pattern)
    }

    fn sample_callback(&self, pattern: &KeyExpr) -> SampleCallback {
        let fanout = self.fanout.clone();
        let pattern = pattern.clone();
        Arc::new(move |sample: Sample| {
            let _ = fanout.dispatch(&pattern, sample);
        })
    }

    async fn undeclare_if_unused(
        &self,
        declared: &mut HashMap<KeyExpr, SubscriptionHandle>,
        release: Release,
    ) {
        if !release.now_unused {
            return;
        }
        if let Some(handle) = declared.remove(&release.pattern) {
            self.session.undeclare(handle).await;
            debug!(pattern = %release.pattern, "pattern no longer held, undeclared");
        }
    }

    // ── Session operations ──────────────────────────────────────────

    /// Connect to the configured locator, then give the default pattern to
    /// channels that joined while no session was live.
    pub async fn connect(&self) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.session
            .connect(&self.config.locator, self.config.response_timeout)
            .await?;
        self.apply_pending_defaults().await;
        Ok(())
    }

    async fn apply_pending_defaults(&self) {
        let Some(pattern) = &self.config.default_subscription else {
            return;
        };
        let pending: Vec<ChannelId> = self.pending_default.lock().drain().collect();
        let mut applied = 0usize;
        for channel in pending {
            if self.pattern_of(&channel).is_some() {
                continue;
            }
            match self.subscribe(&channel, pattern).await {
                Ok(()) => applied += 1,
                Err(RelayError::UnknownChannel(_)) => {}
                Err(error) => {
                    debug!(%channel, %pattern, %error, "default subscription deferred");
                    let _ = self.pending_default.lock().insert(channel);
                }
            }
        }
        if applied > 0 {
            info!(%pattern, channels = applied, "default subscription applied after connect");
        }
    }

    /// Publish `payload` under the concrete `key`.
    pub async fn publish(&self, key: &KeyExpr, payload: Bytes) -> Result<(), RelayError> {
        self.connect_on_demand().await;
        let result = self.session.publish(key, payload).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!(RELAY_PUBLISHES_TOTAL, "outcome" => outcome).increment(1);
        result.map_err(RelayError::from)
    }

    /// Run a query and collect its replies.
    pub async fn query(&self, pattern: &KeyExpr, payload: Option<Bytes>) -> Result<QueryOutcome, RelayError> {
        self.connect_on_demand().await;
        let outcome = self.queries.execute(pattern, payload).await?;
        let termination = if outcome.truncated {
            "truncated"
        } else if outcome.is_complete() {
            "completed"
        } else {
            "timed_out"
        };
        counter!(RELAY_QUERIES_TOTAL, "termination" => termination).increment(1);
        Ok(outcome)
    }

    async fn connect_on_demand(&self) {
        if !self.config.connect_on_demand || self.session.state() == SessionState::Connected {
            return;
        }
        if let Err(error) = self.connect().await {
            debug!(%error, "on-demand connect failed");
        }
    }

    /// Current session status.
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Counters for health reporting.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            state: self.session.state(),
            channels: self.channels.len(),
            patterns: self.registry.read().pattern_count(),
        }
    }

    /// Close the broker session and every channel.
    ///
    /// Channels receive a final `Disconnected` status before their outboxes
    /// close. Later connects fail with [`RelayError::Closed`]. Only the first
    /// call does any work.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.status_task.lock().take() {
            task.abort();
        }
        {
            let mut declared = self.declared.lock().await;
            declared.clear();
            *self.registry.write() = SubscriptionRegistry::new();
        }
        self.pending_default.lock().clear();
        self.session.close().await;

        let _ = self.fanout.broadcast(ChannelEvent::StatusChanged {
            state: SessionState::Disconnected,
            reason: Some("relay shutting down".to_owned()),
        });
        let channels = self.channels.drain();
        for channel in &channels {
            let _ = channel.close();
        }
        set_gauge(RELAY_CHANNELS_ACTIVE, 0);
        set_gauge(RELAY_PATTERNS_ACTIVE, 0);
        info!(channels = channels.len(), "relay shut down");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(task) = self.status_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn forward_status(mut rx: broadcast::Receiver<SessionStatus>, fanout: RelayFanout) {
    loop {
        match rx.recv().await {
            Ok(status) => {
                let _ = fanout.broadcast(ChannelEvent::StatusChanged {
                    state: status.state,
                    reason: status.reason,
                });
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "status forwarder lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn set_gauge(name: &'static str, value: usize) {
    gauge!(name).set(value as f64);
}
