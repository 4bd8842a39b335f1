//! RPC error codes and error type.

use keyrelay_broker::PublishError;
use keyrelay_relay::RelayError;

use crate::rpc::types::RpcErrorBody;

// ── Error code constants ────────────────────────────────────────────

/// Invalid or missing parameters, including malformed key expressions.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// No live broker session.
pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
/// The broker failed or rejected the operation.
pub const BROKER_ERROR: &str = "BROKER_ERROR";
/// Method not found in the registry.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Error returned by method handlers and HTTP routes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Required parameter missing, wrong type, or not a valid key.
    #[error("{message}")]
    InvalidParams {
        /// What is wrong.
        message: String,
    },
    /// The operation needs a live broker session.
    #[error("{message}")]
    NotConnected {
        /// Description.
        message: String,
    },
    /// The broker failed the operation.
    #[error("{message}")]
    Broker {
        /// Description.
        message: String,
    },
    /// Anything else.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl RpcError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::NotConnected { .. } => NOT_CONNECTED,
            Self::Broker { .. } => BROKER_ERROR,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> RpcErrorBody {
        RpcErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
        }
    }

    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }
}

impl From<RelayError> for RpcError {
    fn from(err: RelayError) -> Self {
        let message = err.to_string();
        if err.is_not_connected() {
            return Self::NotConnected { message };
        }
        match err {
            RelayError::InvalidKey(_) | RelayError::Publish(PublishError::NotConcrete(_)) => {
                Self::InvalidParams { message }
            }
            RelayError::UnknownChannel(_) => Self::Internal { message },
            RelayError::Closed => Self::NotConnected { message },
            RelayError::Connect(_)
            | RelayError::Publish(_)
            | RelayError::Subscribe(_)
            | RelayError::Query(_) => Self::Broker { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use keyrelay_broker::{BrokerError, ConnectError, QueryError, SubscribeError};
    use keyrelay_core::{ChannelId, KeyExpr};

    use super::*;

    #[test]
    fn codes_per_variant() {
        assert_eq!(RpcError::invalid_params("x").code(), INVALID_PARAMS);
        assert_eq!(
            RpcError::NotConnected { message: "x".into() }.code(),
            NOT_CONNECTED
        );
        assert_eq!(RpcError::Broker { message: "x".into() }.code(), BROKER_ERROR);
        assert_eq!(RpcError::Internal { message: "x".into() }.code(), INTERNAL_ERROR);
    }

    #[test]
    fn error_body_carries_message() {
        let body = RpcError::invalid_params("Missing required parameter: pattern").to_error_body();
        assert_eq!(body.code, INVALID_PARAMS);
        assert_eq!(body.message, "Missing required parameter: pattern");
    }

    #[test]
    fn not_connected_relay_errors_map_to_not_connected() {
        for err in [
            RelayError::from(PublishError::NotConnected),
            RelayError::from(SubscribeError::NotConnected),
            RelayError::from(QueryError::NotConnected),
        ] {
            assert_eq!(RpcError::from(err).code(), NOT_CONNECTED);
        }
    }

    #[test]
    fn key_errors_map_to_invalid_params() {
        let bad = KeyExpr::new("a//b").unwrap_err();
        assert_eq!(RpcError::from(RelayError::from(bad)).code(), INVALID_PARAMS);

        let wild = RelayError::from(PublishError::NotConcrete("a/*".into()));
        assert_eq!(RpcError::from(wild).code(), INVALID_PARAMS);
    }

    #[test]
    fn broker_failures_map_to_broker_error() {
        let err = RelayError::from(ConnectError::from(BrokerError::Unreachable(
            "mem://local".into(),
        )));
        let rpc = RpcError::from(err);
        assert_eq!(rpc.code(), BROKER_ERROR);
        assert_eq!(rpc.to_string(), "broker unreachable at 'mem://local'");

        let err = RelayError::from(PublishError::Broker(BrokerError::SessionClosed));
        assert_eq!(RpcError::from(err).code(), BROKER_ERROR);
    }

    #[test]
    fn unknown_channel_is_internal() {
        let err = RelayError::UnknownChannel(ChannelId::from("gone"));
        assert_eq!(RpcError::from(err).code(), INTERNAL_ERROR);
    }
}
