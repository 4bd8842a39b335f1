//! Owner of the process-wide broker session.
//!
//! [`SessionManager`] holds at most one live [`PubSubSession`] and the table
//! of subscriptions declared through it. Subscriptions are reference counted
//! per pattern: the first declare for a pattern creates the broker-side
//! subscriber, later declares attach another callback to it, and the
//! subscriber is undeclared when the last handle is released.
//!
//! Every mutation (connect, close, declare, undeclare) runs under one async
//! mutex. Sample dispatch never takes it: the broker-side handler reads a
//! callback list behind its own short-lived lock.
//!
//! There is no automatic retry. A failed connect leaves the state `Failed`
//! until someone calls [`SessionManager::connect`] again. When a live
//! session's link drops, the subscription table is kept and re-declared by
//! the next successful connect.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use keyrelay_core::{KeyExpr, Sample};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{ConnectError, PublishError, QueryError, SubscribeError};
use crate::query::QueryReplies;
use crate::session::{BrokerSubscriberId, Connector, PubSubSession, SampleHandler};

/// Status events buffered per observer before it starts lagging.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Callback registered through [`SessionManager::declare_subscription`].
pub type SampleCallback = Arc<dyn Fn(Sample) + Send + Sync>;

/// Connection state of the broker session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session, none attempted or closed on purpose.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// A live session exists.
    Connected,
    /// The last connect failed or the link was lost.
    Failed,
}

impl SessionState {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the session state, as broadcast to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    /// Current state.
    pub state: SessionState,
    /// Locator of the live or last attempted session.
    pub locator: Option<String>,
    /// Why the session is `Failed`.
    pub reason: Option<String>,
}

impl SessionStatus {
    fn disconnected() -> Self {
        Self {
            state: SessionState::Disconnected,
            locator: None,
            reason: None,
        }
    }
}

/// Handle returned by [`SessionManager::declare_subscription`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// Shared owner of the broker session. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    table: Mutex<Table>,
    status: RwLock<SessionStatus>,
    status_tx: broadcast::Sender<SessionStatus>,
}

#[derive(Default)]
struct Table {
    live: Option<LiveSession>,
    generation: u64,
    next_handle: u64,
    subscriptions: HashMap<KeyExpr, Declared>,
    handles: HashMap<SubscriptionHandle, KeyExpr>,
}

struct LiveSession {
    session: Arc<dyn PubSubSession>,
    response_timeout: Duration,
    watcher: JoinHandle<()>,
}

type CallbackList = Arc<RwLock<Vec<(SubscriptionHandle, SampleCallback)>>>;

struct Declared {
    broker_id: Option<BrokerSubscriberId>,
    callbacks: CallbackList,
}

/// Broker-side handler that forwards each sample to the attached callbacks.
fn fan_in(callbacks: &CallbackList) -> SampleHandler {
    let callbacks = Arc::clone(callbacks);
    Arc::new(move |sample: Sample| {
        let snapshot: Vec<SampleCallback> = callbacks
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in snapshot {
            cb(sample.clone());
        }
    })
}

impl SessionManager {
    /// Create a manager that opens sessions through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                connector,
                table: Mutex::new(Table::default()),
                status: RwLock::new(SessionStatus::disconnected()),
                status_tx,
            }),
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.shared.status.read().state
    }

    /// Current status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.shared.status.read().clone()
    }

    /// Observe every status change from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Open a session to `locator`. A no-op when already connected.
    ///
    /// `timeout` bounds the attempt and becomes the session's response
    /// timeout for queries. On failure the state becomes `Failed` and the
    /// error is broadcast. Existing subscriptions are re-declared on the
    /// new session.
    pub async fn connect(&self, locator: &str, timeout: Duration) -> Result<(), ConnectError> {
        let mut table = self.shared.table.lock().await;
        if table.live.is_some() {
            return Ok(());
        }

        self.shared
            .set_status(SessionState::Connecting, Some(locator), None);
        let opened = tokio::time::timeout(timeout, self.shared.connector.open(locator)).await;
        let session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(self.fail_connect(locator, err.into())),
            Err(_elapsed) => {
                return Err(self.fail_connect(
                    locator,
                    ConnectError::Timeout {
                        locator: locator.to_owned(),
                        timeout,
                    },
                ));
            }
        };

        for (pattern, declared) in &mut table.subscriptions {
            match session
                .declare_subscriber(pattern, fan_in(&declared.callbacks))
                .await
            {
                Ok(id) => declared.broker_id = Some(id),
                Err(error) => {
                    warn!(%pattern, %error, "failed to re-declare subscription");
                    declared.broker_id = None;
                }
            }
        }

        table.generation += 1;
        let watcher = self.spawn_watcher(Arc::clone(&session), table.generation);
        table.live = Some(LiveSession {
            session,
            response_timeout: timeout,
            watcher,
        });
        info!(
            locator,
            resubscribed = table.subscriptions.len(),
            "broker session connected"
        );
        self.shared
            .set_status(SessionState::Connected, Some(locator), None);
        Ok(())
    }

    fn fail_connect(&self, locator: &str, err: ConnectError) -> ConnectError {
        warn!(locator, error = %err, "broker connect failed");
        self.shared
            .set_status(SessionState::Failed, Some(locator), Some(err.to_string()));
        err
    }

    /// Watch for link loss on the session of `generation`.
    fn spawn_watcher(&self, session: Arc<dyn PubSubSession>, generation: u64) -> JoinHandle<()> {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            session.closed().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut table = shared.table.lock().await;
            if table.generation != generation || table.live.is_none() {
                return;
            }
            table.live = None;
            for declared in table.subscriptions.values_mut() {
                declared.broker_id = None;
            }
            let locator = shared.status.read().locator.clone();
            warn!(
                locator = locator.as_deref().unwrap_or_default(),
                subscriptions = table.subscriptions.len(),
                "broker session lost"
            );
            shared.set_status(
                SessionState::Failed,
                locator.as_deref(),
                Some("broker link lost".to_owned()),
            );
        })
    }

    /// Publish `payload` under the concrete `key`.
    pub async fn publish(&self, key: &KeyExpr, payload: Bytes) -> Result<(), PublishError> {
        if key.is_wild() {
            return Err(PublishError::NotConcrete(key.to_string()));
        }
        let (session, _) = self.live().await.ok_or(PublishError::NotConnected)?;
        session.put(key, payload).await?;
        debug!(%key, "published");
        Ok(())
    }

    /// Register `on_sample` for samples matching `pattern`.
    ///
    /// Shares the broker-side subscriber when the pattern is already
    /// declared. `on_sample` may run on any thread and must not block.
    pub async fn declare_subscription(
        &self,
        pattern: &KeyExpr,
        on_sample: SampleCallback,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        let mut table = self.shared.table.lock().await;
        let session = match &table.live {
            Some(live) => Arc::clone(&live.session),
            None => return Err(SubscribeError::NotConnected),
        };

        match table.subscriptions.get_mut(pattern) {
            Some(declared) => {
                if declared.broker_id.is_none() {
                    declared.broker_id = Some(
                        session
                            .declare_subscriber(pattern, fan_in(&declared.callbacks))
                            .await?,
                    );
                }
            }
            None => {
                let callbacks: CallbackList = Arc::new(RwLock::new(Vec::new()));
                let broker_id = session
                    .declare_subscriber(pattern, fan_in(&callbacks))
                    .await?;
                let _ = table.subscriptions.insert(
                    pattern.clone(),
                    Declared {
                        broker_id: Some(broker_id),
                        callbacks,
                    },
                );
            }
        }

        table.next_handle += 1;
        let handle = SubscriptionHandle(table.next_handle);
        let _ = table.handles.insert(handle, pattern.clone());
        let refcount = table.subscriptions.get(pattern).map_or(0, |declared| {
            let mut callbacks = declared.callbacks.write();
            callbacks.push((handle, on_sample));
            callbacks.len()
        });
        debug!(%pattern, %handle, refcount, "subscription declared");
        Ok(handle)
    }

    /// Release `handle`. The broker-side subscriber goes away with the last
    /// handle for its pattern. Unknown handles are ignored.
    pub async fn undeclare(&self, handle: SubscriptionHandle) {
        let mut table = self.shared.table.lock().await;
        let Some(pattern) = table.handles.remove(&handle) else {
            return;
        };
        let remaining = table.subscriptions.get(&pattern).map_or(0, |declared| {
            let mut callbacks = declared.callbacks.write();
            callbacks.retain(|(h, _)| *h != handle);
            callbacks.len()
        });
        debug!(%pattern, %handle, refcount = remaining, "subscription released");
        if remaining > 0 {
            return;
        }

        let Some(declared) = table.subscriptions.remove(&pattern) else {
            return;
        };
        if let (Some(id), Some(live)) = (declared.broker_id, &table.live) {
            if let Err(error) = live.session.undeclare_subscriber(id).await {
                warn!(%pattern, %error, "failed to undeclare subscription");
            }
        }
    }

    /// Start a query. Replies arrive until the broker completes the query or
    /// the session's response timeout elapses.
    pub async fn query(&self, pattern: &KeyExpr, payload: Option<Bytes>) -> Result<QueryReplies, QueryError> {
        let (session, timeout) = self.live().await.ok_or(QueryError::NotConnected)?;
        let replies = session.get(pattern, payload).await?;
        Ok(QueryReplies::new(replies, timeout))
    }

    /// Release every subscription, close the session and move to
    /// `Disconnected`. Safe to call repeatedly.
    pub async fn close(&self) {
        let mut table = self.shared.table.lock().await;
        let live = table.live.take();
        let subscriptions = std::mem::take(&mut table.subscriptions);
        table.handles.clear();

        if let Some(live) = live {
            live.watcher.abort();
            for (pattern, declared) in subscriptions {
                if let Some(id) = declared.broker_id {
                    if let Err(error) = live.session.undeclare_subscriber(id).await {
                        warn!(%pattern, %error, "failed to undeclare subscription during close");
                    }
                }
            }
            live.session.close().await;
            info!("broker session closed");
        }
        let locator = self.shared.status.read().locator.clone();
        self.shared
            .set_status(SessionState::Disconnected, locator.as_deref(), None);
    }

    /// Number of handles attached to `pattern`.
    pub async fn refcount(&self, pattern: &KeyExpr) -> usize {
        let table = self.shared.table.lock().await;
        table
            .subscriptions
            .get(pattern)
            .map_or(0, |declared| declared.callbacks.read().len())
    }

    /// Patterns currently in the subscription table, sorted.
    pub async fn patterns(&self) -> Vec<KeyExpr> {
        let table = self.shared.table.lock().await;
        let mut patterns: Vec<KeyExpr> = table.subscriptions.keys().cloned().collect();
        patterns.sort();
        patterns
    }

    async fn live(&self) -> Option<(Arc<dyn PubSubSession>, Duration)> {
        let table = self.shared.table.lock().await;
        table
            .live
            .as_ref()
            .map(|live| (Arc::clone(&live.session), live.response_timeout))
    }
}

impl Shared {
    fn set_status(&self, state: SessionState, locator: Option<&str>, reason: Option<String>) {
        let status = SessionStatus {
            state,
            locator: locator.map(str::to_owned),
            reason,
        };
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        debug!(state = %status.state, "session status changed");
        // no observers is fine
        let _ = self.status_tx.send(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBroker;
    use crate::errors::BrokerError;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn ke(s: &str) -> KeyExpr {
        KeyExpr::new(s).unwrap()
    }

    fn setup() -> (MemoryBroker, SessionManager) {
        let broker = MemoryBroker::new();
        let manager = SessionManager::new(Arc::new(broker.clone()));
        (broker, manager)
    }

    fn counter() -> (SampleCallback, Arc<parking_lot::Mutex<Vec<String>>>) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: SampleCallback = Arc::new(move |s: Sample| {
            sink.lock().push(format!("{}={}", s.key, s.payload_lossy()));
        });
        (cb, seen)
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let (_, manager) = setup();
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (broker, manager) = setup();
        manager.connect("mem://local", TIMEOUT).await.unwrap();
        manager.connect("mem://local", TIMEOUT).await.unwrap();
        assert_eq!(manager.state(), SessionState::Connected);
        assert_eq!(broker.session_count(), 1);
    }

    #[tokio::test]
    async fn failed_connect_is_reported_and_not_retried() {
        let (broker, manager) = setup();
        broker.set_reachable(false);
        let mut status = manager.subscribe_status();

        let err = manager.connect("mem://local", TIMEOUT).await.unwrap_err();
        assert_eq!(
            err,
            ConnectError::Broker(BrokerError::Unreachable("mem://local".into()))
        );
        assert_eq!(manager.state(), SessionState::Failed);

        assert_eq!(status.recv().await.unwrap().state, SessionState::Connecting);
        let failed = status.recv().await.unwrap();
        assert_eq!(failed.state, SessionState::Failed);
        assert!(failed.reason.unwrap().contains("unreachable"));

        broker.set_reachable(true);
        assert_eq!(manager.state(), SessionState::Failed);
        manager.connect("mem://local", TIMEOUT).await.unwrap();
        assert_eq!(manager.state(), SessionState::Connected);
    }

    struct Hanging;

    #[async_trait::async_trait]
    impl Connector for Hanging {
        async fn open(&self, _locator: &str) -> Result<Arc<dyn PubSubSession>, BrokerError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out() {
        let manager = SessionManager::new(Arc::new(Hanging));
        let err = manager
            .connect("tcp/10.0.0.1:7447", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Timeout { .. }));
        assert_eq!(manager.state(), SessionState::Failed);
        assert_eq!(
            manager.status().locator.as_deref(),
            Some("tcp/10.0.0.1:7447")
        );
    }

    #[tokio::test]
    async fn publish_requires_session() {
        let (_, manager) = setup();
        let key = ke("cmd/led");
        assert_eq!(
            manager.publish(&key, Bytes::from("on")).await,
            Err(PublishError::NotConnected)
        );
        manager.connect("mem://local", TIMEOUT).await.unwrap();
        assert_eq!(manager.publish(&key, Bytes::from("on")).await, Ok(()));
    }

    #[tokio::test]
    async fn publish_rejects_patterns() {
        let (_, manager) = setup();
        manager.connect("mem://local", TIMEOUT).await.unwrap();
        assert_eq!(
            manager.publish(&ke("cmd/*"), Bytes::new()).await,
            Err(PublishError::NotConcrete("cmd/*".into()))
        );
    }

    #[tokio::test]
    async fn declare_requires_session() {
        let (_, manager) = setup();
        let (cb, _) = counter();
        assert_eq!(
            manager.declare_subscription(&ke("a"), cb).await,
            Err(SubscribeError::NotConnected)
        );
    }

    #[tokio::test]
    async fn same_pattern_shares_one_broker_subscriber() {
        let (broker, manager) = setup();
        manager.connect("mem://local", TIMEOUT).await.unwrap();
        let (cb1, seen1) = counter();
        let (cb2, seen2) = counter();
        let pattern = ke("temp/**");

        let h1 = manager.declare_subscription(&pattern, cb1).await.unwrap();
        let h2 = manager.declare_subscription(&pattern, cb2).await.unwrap();
        assert_ne!(h1, h2);
        assert_eq!(manager.refcount(&pattern).await, 2);
        assert_eq!(broker.subscriber_patterns(), vec![pattern.clone()]);

        broker.put(&ke("temp/room1"), "21.5");
        assert_eq!(*seen1.lock(), vec!["temp/room1=21.5"]);
        assert_eq!(*seen2.lock(), vec!["temp/room1=21.5"]);

        manager.undeclare(h1).await;
        assert_eq!(manager.refcount(&pattern).await, 1);
        assert_eq!(broker.subscriber_patterns().len(), 1);

        manager.undeclare(h2).await;
        assert_eq!(manager.refcount(&pattern).await, 0);
        assert!(broker.subscriber_patterns().is_empty());
    }

    #[tokio::test]
    async fn undeclare_unknown_handle_is_noop() {
        let (broker, manager) = setup();
        manager.connect("mem://local", TIMEOUT).await.unwrap();
        let (cb, _) = counter();
        let handle = manager.declare_subscription(&ke("a"), cb).await.unwrap();
        manager.undeclare(handle).await;
        manager.undeclare(handle).await;
        manager.undeclare(SubscriptionHandle(999)).await;
        assert!(broker.subscriber_patterns().is_empty());
    }

    #[tokio::test]
    async fn close_releases_everything_and_is_repeatable() {
        let (broker, manager) = setup();
        manager.connect("mem://local", TIMEOUT).await.unwrap();
        let (cb, _) = counter();
        let _ = manager.declare_subscription(&ke("a/**"), cb).await.unwrap();

        manager.close().await;
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(broker.subscriber_patterns().is_empty());
        assert_eq!(broker.session_count(), 0);
        assert!(manager.patterns().await.is_empty());

        manager.close().await;
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn link_loss_fails_then_reconnect_redeclares() {
        let (broker, manager) = setup();
        manager.connect("mem://local", TIMEOUT).await.unwrap();
        let mut status = manager.subscribe_status();
        let (cb, seen) = counter();
        let _ = manager.declare_subscription(&ke("temp/**"), cb).await.unwrap();

        let _ = broker.sever_sessions();
        let lost = status.recv().await.unwrap();
        assert_eq!(lost.state, SessionState::Failed);
        assert_eq!(lost.reason.as_deref(), Some("broker link lost"));
        assert_eq!(
            manager.publish(&ke("temp/x"), Bytes::new()).await,
            Err(PublishError::NotConnected)
        );
        assert_eq!(manager.patterns().await, vec![ke("temp/**")]);

        manager.connect("mem://local", TIMEOUT).await.unwrap();
        assert_eq!(broker.subscriber_patterns(), vec![ke("temp/**")]);
        broker.put(&ke("temp/room2"), "19");
        assert_eq!(*seen.lock(), vec!["temp/room2=19"]);
    }

    #[tokio::test]
    async fn query_requires_session() {
        let (_, manager) = setup();
        assert!(matches!(
            manager.query(&ke("a/**"), None).await,
            Err(QueryError::NotConnected)
        ));
    }

    #[test]
    fn state_wire_names() {
        assert_eq!(SessionState::Connected.to_string(), "connected");
        assert_eq!(
            serde_json::to_string(&SessionState::Failed).unwrap(),
            r#""failed""#
        );
    }
}
