//! The broker boundary.
//!
//! [`Connector`] opens sessions for a locator; [`PubSubSession`] is the
//! capability set the relay consumes. Implementations own the wire protocol
//! and the key-expression routing; nothing above this module looks inside.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use keyrelay_core::{KeyExpr, Reply, Sample};
use tokio::sync::mpsc;

use crate::errors::BrokerError;

/// Callback invoked for every sample routed to a broker-side subscriber.
///
/// May run on any thread, including inside the publisher's call stack.
/// Must return promptly.
pub type SampleHandler = Arc<dyn Fn(Sample) + Send + Sync>;

/// Replies to a `get`, in arrival order.
///
/// The stream ends (`recv` yields `None`) when the broker signals completion.
/// Dropping the receiver cancels the query broker-side.
pub type ReplyStream = mpsc::Receiver<Reply>;

/// Broker-assigned identifier of one subscriber declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerSubscriberId(pub u64);

impl fmt::Display for BrokerSubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One live broker session.
#[async_trait]
pub trait PubSubSession: Send + Sync {
    /// Publish `payload` under a concrete key.
    async fn put(&self, key: &KeyExpr, payload: Bytes) -> Result<(), BrokerError>;

    /// Declare a subscriber for `pattern`.
    async fn declare_subscriber(
        &self,
        pattern: &KeyExpr,
        handler: SampleHandler,
    ) -> Result<BrokerSubscriberId, BrokerError>;

    /// Tear down a subscriber declaration.
    async fn undeclare_subscriber(&self, id: BrokerSubscriberId) -> Result<(), BrokerError>;

    /// Start a query.
    async fn get(&self, pattern: &KeyExpr, payload: Option<Bytes>) -> Result<ReplyStream, BrokerError>;

    /// Close the session. Idempotent.
    async fn close(&self);

    /// Resolves once the session is no longer usable, whether through
    /// [`close`](Self::close) or link loss.
    async fn closed(&self);
}

/// Opens broker sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session to the broker at `locator`.
    async fn open(&self, locator: &str) -> Result<Arc<dyn PubSubSession>, BrokerError>;
}
