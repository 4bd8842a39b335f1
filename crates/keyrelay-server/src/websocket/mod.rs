//! WebSocket sessions.

pub mod events;
pub mod handler;
pub mod heartbeat;
pub mod session;
