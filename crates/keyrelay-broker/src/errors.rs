//! Broker and session error types.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a [`PubSubSession`](crate::PubSubSession) or
/// [`Connector`](crate::Connector) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Nothing answered at the locator.
    #[error("broker unreachable at '{0}'")]
    Unreachable(String),
    /// No connector understands this locator.
    #[error("unsupported locator '{0}'")]
    UnsupportedLocator(String),
    /// The session was closed or lost its link.
    #[error("broker session is closed")]
    SessionClosed,
    /// The broker refused the operation.
    #[error("broker rejected the request: {0}")]
    Rejected(String),
}

/// Why `SessionManager::connect` failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// The connector did not answer within the response timeout.
    #[error("connect to '{locator}' timed out after {timeout:?}")]
    Timeout {
        /// Locator that was tried.
        locator: String,
        /// Configured bound.
        timeout: Duration,
    },
    /// The connector reported an error.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Why a publish failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// No live session.
    #[error("not connected to the broker")]
    NotConnected,
    /// Publishing requires a concrete key.
    #[error("cannot publish on '{0}': key contains wildcards")]
    NotConcrete(String),
    /// The broker refused the put.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Why a subscription could not be declared.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    /// No live session.
    #[error("not connected to the broker")]
    NotConnected,
    /// The broker refused the declaration.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Why a query could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// No live session.
    #[error("not connected to the broker")]
    NotConnected,
    /// The broker refused the query.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
