//! # keyrelay-broker
//!
//! The upstream side of the relay:
//!
//! - **Boundary**: [`Connector`] and [`PubSubSession`], the broker capabilities
//!   the relay consumes
//! - **In-process broker**: [`MemoryBroker`] for `mem://` locators
//! - **Session ownership**: [`SessionManager`], the single reference-counted
//!   broker session
//! - **Queries**: [`QueryReplies`] and [`QueryCoordinator`]

#![deny(unsafe_code)]

pub mod errors;
pub mod manager;
pub mod memory;
pub mod query;
pub mod session;

pub use errors::{BrokerError, ConnectError, PublishError, QueryError, SubscribeError};
pub use manager::{SampleCallback, SessionManager, SessionState, SessionStatus, SubscriptionHandle};
pub use memory::{MEMORY_SCHEME, MemoryBroker, QueryRequest, QueryableId, Replier};
pub use query::{QueryCoordinator, QueryOutcome, QueryReplies, QueryTermination};
pub use session::{BrokerSubscriberId, Connector, PubSubSession, ReplyStream, SampleHandler};
