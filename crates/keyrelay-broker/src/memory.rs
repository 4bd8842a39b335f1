//! In-process broker addressed by `mem://<name>` locators.
//!
//! Routes samples from `put` to every subscriber whose pattern matches, calling
//! handlers synchronously in the publisher's call stack, so per-subscriber
//! order equals publish order. Queries are answered by declared queryables
//! and, when storage is enabled, by the latest stored value per key.
//!
//! Fault injection: [`MemoryBroker::set_reachable`] makes `open` fail and
//! [`MemoryBroker::sever_sessions`] drops every live session as if the link
//! had gone away.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use keyrelay_core::{KeyExpr, Reply, Sample};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::BrokerError;
use crate::session::{BrokerSubscriberId, Connector, PubSubSession, ReplyStream, SampleHandler};

/// Locator scheme served by [`MemoryBroker`].
pub const MEMORY_SCHEME: &str = "mem://";

/// Buffered replies per query before repliers wait.
const REPLY_BUFFER: usize = 64;

/// Handler invoked for each query routed to a queryable.
///
/// Runs inside `get`; handlers that answer asynchronously should move the
/// request into a spawned task.
pub type QueryHandler = Arc<dyn Fn(QueryRequest) + Send + Sync>;

/// A query as seen by a queryable.
pub struct QueryRequest {
    /// Pattern the querier asked for.
    pub pattern: KeyExpr,
    /// Optional request payload.
    pub payload: Option<Bytes>,
    /// Channel back to the querier.
    pub replier: Replier,
}

/// Sends replies for one query. The query completes when every replier
/// for it has been dropped.
#[derive(Clone)]
pub struct Replier {
    tx: mpsc::Sender<Reply>,
}

impl Replier {
    /// Send a successful reply. Returns `false` if the querier went away.
    pub async fn reply(&self, key: KeyExpr, payload: impl Into<Bytes>) -> bool {
        self.tx.send(Reply::ok(key, payload)).await.is_ok()
    }

    /// Send an error reply. Returns `false` if the querier went away.
    pub async fn reply_err(&self, message: impl Into<String>) -> bool {
        self.tx.send(Reply::err(message)).await.is_ok()
    }

    /// Whether the querier has stopped listening.
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Identifier of a declared queryable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueryableId(u64);

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    reachable: AtomicBool,
    storage_enabled: bool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
    queryables: BTreeMap<u64, Queryable>,
    sessions: HashMap<u64, CancellationToken>,
    storage: BTreeMap<KeyExpr, Bytes>,
}

impl State {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Subscriber {
    session: u64,
    pattern: KeyExpr,
    handler: SampleHandler,
}

struct Queryable {
    pattern: KeyExpr,
    handler: QueryHandler,
}

impl MemoryBroker {
    /// A broker without storage.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A broker that keeps the latest value per key and answers queries
    /// from it.
    pub fn with_storage() -> Self {
        Self::build(true)
    }

    fn build(storage_enabled: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                reachable: AtomicBool::new(true),
                storage_enabled,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Toggle whether `open` succeeds.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Publish as an external peer would.
    pub fn put(&self, key: &KeyExpr, payload: impl Into<Bytes>) {
        self.inner.publish(key, payload.into());
    }

    /// Declare a queryable answering queries that intersect `pattern`.
    pub fn declare_queryable<F>(&self, pattern: KeyExpr, handler: F) -> QueryableId
    where
        F: Fn(QueryRequest) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        let id = state.allocate();
        let _ = state.queryables.insert(
            id,
            Queryable {
                pattern,
                handler: Arc::new(handler),
            },
        );
        QueryableId(id)
    }

    /// Remove a queryable. Unknown ids are ignored.
    pub fn undeclare_queryable(&self, id: QueryableId) {
        let _ = self.inner.state.lock().queryables.remove(&id.0);
    }

    /// Drop every live session as if the link had been lost. Returns how many
    /// sessions were severed.
    pub fn sever_sessions(&self) -> usize {
        let tokens: Vec<CancellationToken> = {
            let mut state = self.inner.state.lock();
            state.subscribers.clear();
            state.sessions.drain().map(|(_, token)| token).collect()
        };
        for token in &tokens {
            token.cancel();
        }
        info!(sessions = tokens.len(), "memory broker severed all sessions");
        tokens.len()
    }

    /// Patterns of all live subscriber declarations, sorted, duplicates kept.
    pub fn subscriber_patterns(&self) -> Vec<KeyExpr> {
        let state = self.inner.state.lock();
        let mut patterns: Vec<KeyExpr> = state
            .subscribers
            .values()
            .map(|s| s.pattern.clone())
            .collect();
        patterns.sort();
        patterns
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Latest stored value for `key`, if storage is enabled.
    pub fn stored(&self, key: &KeyExpr) -> Option<Bytes> {
        self.inner.state.lock().storage.get(key).cloned()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn publish(&self, key: &KeyExpr, payload: Bytes) {
        let handlers: Vec<SampleHandler> = {
            let mut state = self.state.lock();
            if self.storage_enabled {
                let _ = state.storage.insert(key.clone(), payload.clone());
            }
            state
                .subscribers
                .values()
                .filter(|s| s.pattern.matches(key))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        let sample = Sample::new(key.clone(), payload);
        for handler in handlers {
            handler(sample.clone());
        }
    }

    fn query(&self, pattern: &KeyExpr, payload: Option<Bytes>) -> ReplyStream {
        let (tx, rx) = mpsc::channel(REPLY_BUFFER);
        let (stored, handlers): (Vec<(KeyExpr, Bytes)>, Vec<QueryHandler>) = {
            let state = self.state.lock();
            let stored = state
                .storage
                .iter()
                .filter(|(key, _)| pattern.matches(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            let handlers = state
                .queryables
                .values()
                .filter(|q| q.pattern.intersects(pattern))
                .map(|q| Arc::clone(&q.handler))
                .collect();
            (stored, handlers)
        };
        debug!(%pattern, stored = stored.len(), queryables = handlers.len(), "memory broker query");

        for handler in handlers {
            handler(QueryRequest {
                pattern: pattern.clone(),
                payload: payload.clone(),
                replier: Replier { tx: tx.clone() },
            });
        }
        if !stored.is_empty() {
            drop(tokio::spawn(async move {
                for (key, value) in stored {
                    if tx.send(Reply::ok(key, value)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        rx
    }

    fn drop_session(&self, session: u64) {
        let mut state = self.state.lock();
        state.subscribers.retain(|_, s| s.session != session);
        let _ = state.sessions.remove(&session);
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn open(&self, locator: &str) -> Result<Arc<dyn PubSubSession>, BrokerError> {
        let name = locator
            .strip_prefix(MEMORY_SCHEME)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| BrokerError::UnsupportedLocator(locator.to_owned()))?;
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable(locator.to_owned()));
        }

        let token = CancellationToken::new();
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.allocate();
            let _ = state.sessions.insert(id, token.clone());
            id
        };
        debug!(name, session = id, "memory broker session opened");
        Ok(Arc::new(MemorySession {
            broker: Arc::clone(&self.inner),
            id,
            token,
        }))
    }
}

struct MemorySession {
    broker: Arc<Inner>,
    id: u64,
    token: CancellationToken,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.token.is_cancelled() {
            Err(BrokerError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PubSubSession for MemorySession {
    async fn put(&self, key: &KeyExpr, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.publish(key, payload);
        Ok(())
    }

    async fn declare_subscriber(
        &self,
        pattern: &KeyExpr,
        handler: SampleHandler,
    ) -> Result<BrokerSubscriberId, BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        let id = state.allocate();
        let _ = state.subscribers.insert(
            id,
            Subscriber {
                session: self.id,
                pattern: pattern.clone(),
                handler,
            },
        );
        Ok(BrokerSubscriberId(id))
    }

    async fn undeclare_subscriber(&self, id: BrokerSubscriberId) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if state.subscribers.get(&id.0).is_some_and(|s| s.session == self.id) {
            let _ = state.subscribers.remove(&id.0);
        }
        Ok(())
    }

    async fn get(&self, pattern: &KeyExpr, payload: Option<Bytes>) -> Result<ReplyStream, BrokerError> {
        self.ensure_open()?;
        Ok(self.broker.query(pattern, payload))
    }

    async fn close(&self) {
        self.broker.drop_session(self.id);
        self.token.cancel();
    }

    async fn closed(&self) {
        self.token.cancelled().await;
    }
}
