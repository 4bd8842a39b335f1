//! Downstream client channels and their registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use keyrelay_broker::SessionState;
use keyrelay_core::{ChannelId, KeyExpr, Sample};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

/// An event pushed to a client channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A sample matching the channel's pattern.
    SampleReceived {
        /// Concrete key of the sample.
        key: KeyExpr,
        /// Payload, unmodified.
        payload: Bytes,
        /// Arrival time at the relay.
        timestamp: DateTime<Utc>,
    },
    /// The broker session changed state.
    StatusChanged {
        /// New state.
        state: SessionState,
        /// Failure reason, when `Failed`.
        reason: Option<String>,
    },
}

impl From<Sample> for ChannelEvent {
    fn from(sample: Sample) -> Self {
        Self::SampleReceived {
            key: sample.key,
            payload: sample.payload,
            timestamp: sample.timestamp,
        }
    }
}

/// Why a delivery did not reach a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// The outbox is full; the event was dropped.
    #[error("channel outbox is full")]
    Full,
    /// The outbox was full once too often; the channel has been closed.
    #[error("channel exceeded its drop budget and was closed")]
    Overflow,
    /// The channel is closed.
    #[error("channel is closed")]
    Closed,
}

/// One connected downstream consumer.
///
/// Events go into a bounded outbox drained by the transport. Delivery never
/// waits: a full outbox drops the event, and after `max_dropped` drops the
/// channel closes itself so the transport can disconnect it.
pub struct ClientChannel {
    id: ChannelId,
    tx: Mutex<Option<mpsc::Sender<Arc<ChannelEvent>>>>,
    max_dropped: u64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    connected_at: Instant,
}

impl ClientChannel {
    /// Create a channel with an outbox of `capacity` events.
    ///
    /// Returns the channel and the receiving end of its outbox.
    pub fn new(
        id: ChannelId,
        capacity: usize,
        max_dropped: u64,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<ChannelEvent>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let channel = Self {
            id,
            tx: Mutex::new(Some(tx)),
            max_dropped,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            connected_at: Instant::now(),
        };
        (Arc::new(channel), rx)
    }

    /// Channel identifier.
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Queue `event` without waiting.
    pub fn deliver(&self, event: Arc<ChannelEvent>) -> Result<(), DeliveryFailure> {
        let mut tx = self.tx.lock();
        let Some(sender) = tx.as_ref() else {
            return Err(DeliveryFailure::Closed);
        };
        match sender.try_send(event) {
            Ok(()) => {
                let _ = self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped >= self.max_dropped {
                    *tx = None;
                    Err(DeliveryFailure::Overflow)
                } else {
                    Err(DeliveryFailure::Full)
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *tx = None;
                Err(DeliveryFailure::Closed)
            }
        }
    }

    /// Close the outbox. The receiver sees the end once it drains what was
    /// already queued. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.tx.lock().take().is_some()
    }

    /// Whether the outbox is closed.
    pub fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().is_none_or(mpsc::Sender::is_closed)
    }

    /// Events queued so far.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Events dropped so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Time since the channel was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Connected channels by id.
#[derive(Default)]
pub struct ClientChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<ClientChannel>>>,
}

impl ClientChannelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel.
    pub fn register(&self, channel: Arc<ClientChannel>) {
        let _ = self.channels.write().insert(channel.id().clone(), channel);
    }

    /// Remove a channel, returning it if it was registered.
    pub fn remove(&self, id: &ChannelId) -> Option<Arc<ClientChannel>> {
        self.channels.write().remove(id)
    }

    /// Look up a channel.
    pub fn get(&self, id: &ChannelId) -> Option<Arc<ClientChannel>> {
        self.channels.read().get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.read().contains_key(id)
    }

    /// Snapshot of all channels.
    pub fn all(&self) -> Vec<Arc<ClientChannel>> {
        self.channels.read().values().cloned().collect()
    }

    /// Remove every channel, returning them.
    pub fn drain(&self) -> Vec<Arc<ClientChannel>> {
        self.channels.write().drain().map(|(_, c)| c).collect()
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    /// Whether no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_event() -> Arc<ChannelEvent> {
        Arc::new(ChannelEvent::StatusChanged {
            state: SessionState::Connected,
            reason: None,
        })
    }

    #[tokio::test]
    async fn deliver_queues_event() {
        let (channel, mut rx) = ClientChannel::new(ChannelId::from("c1"), 4, 10);
        channel.deliver(status_event()).unwrap();
        assert_eq!(channel.delivered_count(), 1);
        assert_eq!(*rx.recv().await.unwrap(), *status_event());
    }

    #[test]
    fn full_outbox_drops_then_closes() {
        let (channel, _rx) = ClientChannel::new(ChannelId::from("c1"), 1, 3);
        channel.deliver(status_event()).unwrap();
        assert_eq!(channel.deliver(status_event()), Err(DeliveryFailure::Full));
        assert_eq!(channel.deliver(status_event()), Err(DeliveryFailure::Full));
        assert_eq!(
            channel.deliver(status_event()),
            Err(DeliveryFailure::Overflow)
        );
        assert_eq!(channel.dropped_count(), 3);
        assert!(channel.is_closed());
        assert_eq!(channel.deliver(status_event()), Err(DeliveryFailure::Closed));
    }

    #[test]
    fn dropped_receiver_reports_closed() {
        let (channel, rx) = ClientChannel::new(ChannelId::from("c1"), 4, 10);
        drop(rx);
        assert!(channel.is_closed());
        assert_eq!(channel.deliver(status_event()), Err(DeliveryFailure::Closed));
    }

    #[tokio::test]
    async fn close_lets_receiver_drain_then_end() {
        let (channel, mut rx) = ClientChannel::new(ChannelId::from("c1"), 4, 10);
        channel.deliver(status_event()).unwrap();
        assert!(channel.close());
        assert!(!channel.close());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn sample_converts_to_event() {
        let key = KeyExpr::concrete("temp/room1").unwrap();
        let sample = Sample::new(key.clone(), "21.5");
        let ts = sample.timestamp;
        assert_eq!(
            ChannelEvent::from(sample),
            ChannelEvent::SampleReceived {
                key,
                payload: Bytes::from("21.5"),
                timestamp: ts,
            }
        );
    }

    #[test]
    fn registry_register_get_remove() {
        let reg = ClientChannelRegistry::new();
        let (c1, _rx1) = ClientChannel::new(ChannelId::from("c1"), 4, 10);
        let (c2, _rx2) = ClientChannel::new(ChannelId::from("c2"), 4, 10);
        reg.register(c1);
        reg.register(c2);
        assert_eq!(reg.len(), 2);
        assert!(reg.contains(&ChannelId::from("c1")));

        let removed = reg.remove(&ChannelId::from("c1")).unwrap();
        assert_eq!(removed.id().as_str(), "c1");
        assert!(reg.get(&ChannelId::from("c1")).is_none());
        assert!(reg.remove(&ChannelId::from("nope")).is_none());

        assert_eq!(reg.drain().len(), 1);
        assert!(reg.is_empty());
    }
}
