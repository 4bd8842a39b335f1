//! Metric names recorded by the relay.
//!
//! Recording is a no-op until the binary installs a recorder.

/// Samples received from the broker, labelled by pattern.
pub const RELAY_SAMPLES_TOTAL: &str = "relay_samples_total";
/// Deliveries dropped because a channel's outbox was full or closed.
pub const RELAY_DELIVERIES_DROPPED_TOTAL: &str = "relay_deliveries_dropped_total";
/// Channels disconnected for overflowing.
pub const RELAY_CHANNELS_EVICTED_TOTAL: &str = "relay_channels_evicted_total";
/// Queries executed, labelled by termination.
pub const RELAY_QUERIES_TOTAL: &str = "relay_queries_total";
/// Publishes, labelled by outcome.
pub const RELAY_PUBLISHES_TOTAL: &str = "relay_publishes_total";
/// Connected client channels.
pub const RELAY_CHANNELS_ACTIVE: &str = "relay_channels_active";
/// Distinct patterns with at least one holder.
pub const RELAY_PATTERNS_ACTIVE: &str = "relay_patterns_active";
