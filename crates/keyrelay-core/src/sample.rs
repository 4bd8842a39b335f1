//! Data carried across the broker boundary: pushed samples and query replies.

use std::borrow::Cow;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::keyexpr::KeyExpr;

/// One inbound broker event for a concrete key.
///
/// Transient: a sample lives only as long as its fan-out takes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    /// The concrete key that was published (never a pattern).
    pub key: KeyExpr,
    /// Opaque payload bytes, forwarded unmodified.
    pub payload: Bytes,
    /// When the sample reached this process.
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// Build a sample stamped with the current time.
    pub fn new(key: KeyExpr, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    /// Payload decoded as UTF-8, with invalid sequences replaced.
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// One result item of a query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// A responder answered for `key`.
    Ok {
        /// Concrete key of the answer.
        key: KeyExpr,
        /// Answer payload.
        payload: Bytes,
    },
    /// A responder reported a failure. Kept in the result; never aborts a query.
    Err {
        /// Error text as reported by the responder.
        message: String,
    },
}

impl Reply {
    /// Shorthand for [`Reply::Ok`].
    pub fn ok(key: KeyExpr, payload: impl Into<Bytes>) -> Self {
        Self::Ok {
            key,
            payload: payload.into(),
        }
    }

    /// Shorthand for [`Reply::Err`].
    pub fn err(message: impl Into<String>) -> Self {
        Self::Err {
            message: message.into(),
        }
    }

    /// Whether this is a successful reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}
