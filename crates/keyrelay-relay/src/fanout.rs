//! Sample fan-out to client channels.

use std::sync::Arc;

use keyrelay_core::{KeyExpr, Sample};
use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelEvent, ClientChannel, ClientChannelRegistry, DeliveryFailure};
use crate::metrics::{
    RELAY_CHANNELS_EVICTED_TOTAL, RELAY_DELIVERIES_DROPPED_TOTAL, RELAY_SAMPLES_TOTAL,
};
use crate::registry::SubscriptionRegistry;

/// Delivers broker samples to the channels interested in them.
///
/// One broker-side subscription exists per pattern, so a sample matching
/// several patterns arrives once per matching pattern. Each arrival goes
/// only to channels whose current pattern is the one that fired, which
/// gives every channel exactly one copy.
#[derive(Clone)]
pub struct RelayFanout {
    registry: Arc<RwLock<SubscriptionRegistry>>,
    channels: Arc<ClientChannelRegistry>,
}

/// Counts from one dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Channels that got the sample queued.
    pub delivered: usize,
    /// Channels that could not take it.
    pub failed: usize,
}

impl RelayFanout {
    /// Fan out over `registry` to the channels in `channels`.
    pub fn new(registry: Arc<RwLock<SubscriptionRegistry>>, channels: Arc<ClientChannelRegistry>) -> Self {
        Self { registry, channels }
    }

    /// Deliver a sample that arrived for `pattern`.
    ///
    /// Never blocks and never fails: delivery problems are logged and
    /// counted per channel. The registry stays read-locked for the whole
    /// dispatch, so a concurrent pattern switch is ordered entirely before
    /// or after it.
    pub fn dispatch(&self, pattern: &KeyExpr, sample: Sample) -> DispatchReport {
        counter!(RELAY_SAMPLES_TOTAL, "pattern" => pattern.to_string()).increment(1);
        let key = sample.key.clone();
        let event = Arc::new(ChannelEvent::from(sample));
        let mut report = DispatchReport::default();

        let registry = self.registry.read();
        for id in registry.channels_for(&key) {
            if registry.pattern_of(&id) != Some(pattern) {
                continue;
            }
            let Some(channel) = self.channels.get(&id) else {
                continue;
            };
            match channel.deliver(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    report.failed += 1;
                    record_failure(&channel, failure);
                }
            }
        }
        drop(registry);

        trace!(
            %pattern,
            %key,
            delivered = report.delivered,
            failed = report.failed,
            "sample dispatched"
        );
        report
    }

    /// Deliver `event` to every connected channel.
    pub fn broadcast(&self, event: ChannelEvent) -> DispatchReport {
        let event = Arc::new(event);
        let mut report = DispatchReport::default();
        for channel in self.channels.all() {
            match channel.deliver(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    report.failed += 1;
                    record_failure(&channel, failure);
                }
            }
        }
        debug!(
            recipients = report.delivered,
            failed = report.failed,
            "broadcast event to all channels"
        );
        report
    }
}

fn record_failure(channel: &ClientChannel, failure: DeliveryFailure) {
    match failure {
        DeliveryFailure::Full => {
            counter!(RELAY_DELIVERIES_DROPPED_TOTAL, "reason" => "full").increment(1);
            debug!(
                channel = %channel.id(),
                dropped = channel.dropped_count(),
                "channel outbox full, event dropped"
            );
        }
        DeliveryFailure::Overflow => {
            counter!(RELAY_DELIVERIES_DROPPED_TOTAL, "reason" => "full").increment(1);
            counter!(RELAY_CHANNELS_EVICTED_TOTAL).increment(1);
            warn!(
                channel = %channel.id(),
                dropped = channel.dropped_count(),
                "channel too slow, disconnecting"
            );
        }
        DeliveryFailure::Closed => {
            counter!(RELAY_DELIVERIES_DROPPED_TOTAL, "reason" => "closed").increment(1);
            trace!(channel = %channel.id(), "delivery to closed channel skipped");
        }
    }
}
