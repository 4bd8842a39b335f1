//! Relay error type.

use keyrelay_broker::{ConnectError, PublishError, QueryError, SubscribeError};
use keyrelay_core::{ChannelId, KeyExprError};
use thiserror::Error;

/// Errors returned by [`Relay`](crate::Relay) operations.
///
/// All of them are local to the calling client; none affects the shared
/// session or other channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// A key or pattern failed validation.
    #[error("invalid key expression: {0}")]
    InvalidKey(#[from] KeyExprError),
    /// The channel is not (or no longer) connected.
    #[error("unknown channel '{0}'")]
    UnknownChannel(ChannelId),
    /// Connecting to the broker failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// Publishing failed.
    #[error(transparent)]
    Publish(#[from] PublishError),
    /// Declaring a subscription failed.
    #[error(transparent)]
    Subscribe(#[from] SubscribeError),
    /// Starting a query failed.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// The relay has been shut down and will not reconnect.
    #[error("relay is shut down")]
    Closed,
}

impl RelayError {
    /// Whether the failure is the absence of a live session.
    pub fn is_not_connected(&self) -> bool {
        matches!(
            self,
            Self::Publish(PublishError::NotConnected)
                | Self::Subscribe(SubscribeError::NotConnected)
                | Self::Query(QueryError::NotConnected)
                | Self::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_detection() {
        assert!(RelayError::from(PublishError::NotConnected).is_not_connected());
        assert!(RelayError::from(QueryError::NotConnected).is_not_connected());
        assert!(RelayError::Closed.is_not_connected());
        assert!(!RelayError::UnknownChannel(ChannelId::from("c")).is_not_connected());
    }

    #[test]
    fn display_passes_through() {
        let err = RelayError::from(SubscribeError::NotConnected);
        assert_eq!(err.to_string(), "not connected to the broker");
    }
}
