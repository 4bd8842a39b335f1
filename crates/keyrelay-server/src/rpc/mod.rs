//! JSON RPC over the WebSocket: wire types, errors, the method registry and
//! the `relay.*` handlers.

pub mod context;
pub mod errors;
pub mod handlers;
pub mod registry;
pub mod types;
