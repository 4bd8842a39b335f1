//! `/health` endpoint.

use std::time::Instant;

use keyrelay_relay::RelayStats;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is running, whatever the broker state.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Connected client channels.
    pub connections: usize,
    /// Broker session state (`connected`, `failed`, ...).
    pub broker: String,
    /// Distinct patterns currently subscribed.
    pub patterns: usize,
}

/// Build a health response from live relay counters.
pub fn health_check(start_time: Instant, stats: &RelayStats) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.channels,
        broker: stats.state.as_str().to_owned(),
        patterns: stats.patterns,
    }
}
