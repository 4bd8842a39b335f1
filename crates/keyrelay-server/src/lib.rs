//! # keyrelay-server
//!
//! Client-facing surface of the relay:
//!
//! - **HTTP**: `/publish`, `/query`, `/connect`, `/health`, `/metrics`
//! - **WebSocket**: `/ws` sessions carrying JSON RPC requests and relay events
//! - **RPC**: [`MethodRegistry`](rpc::registry::MethodRegistry) with the
//!   `relay.*` handlers
//! - **Lifecycle**: heartbeat, connection cap, graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod routes;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{ServerConfig, relay_config};
pub use server::{AppState, KeyRelayServer};
pub use shutdown::{ShutdownCoordinator, ShutdownPhase};
