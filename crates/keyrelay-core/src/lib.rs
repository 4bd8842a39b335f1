//! # keyrelay-core
//!
//! Shared vocabulary for the keyrelay bridge:
//!
//! - **Key expressions**: [`KeyExpr`] validation plus wildcard matching (`*`, `**`)
//! - **Samples and replies**: [`Sample`] for pushed data, [`Reply`] for query results
//! - **Channel IDs**: [`ChannelId`] newtype for downstream client connections
//! - **Logging**: [`logging::init_subscriber`] bootstrap for `tracing`

#![deny(unsafe_code)]

pub mod ids;
pub mod keyexpr;
pub mod logging;
pub mod sample;

pub use ids::ChannelId;
pub use keyexpr::{KeyExpr, KeyExprError};
pub use sample::{Reply, Sample};
