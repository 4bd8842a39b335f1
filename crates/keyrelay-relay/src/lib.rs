//! # keyrelay-relay
//!
//! Downstream side of the bridge:
//!
//! - **Registry**: [`SubscriptionRegistry`], pure pattern ↔ channel bookkeeping
//! - **Channels**: [`ClientChannel`] with a bounded outbox, and
//!   [`ClientChannelRegistry`]
//! - **Fan-out**: [`RelayFanout`], non-blocking per-channel delivery
//! - **Facade**: [`Relay`], the transport-agnostic client API

#![deny(unsafe_code)]

pub mod channel;
pub mod errors;
pub mod fanout;
pub mod metrics;
pub mod registry;
pub mod relay;

pub use channel::{ChannelEvent, ClientChannel, ClientChannelRegistry, DeliveryFailure};
pub use errors::RelayError;
pub use fanout::{DispatchReport, RelayFanout};
pub use registry::{Release, SubscriptionRegistry};
pub use relay::{Relay, RelayConfig, RelayStats};
