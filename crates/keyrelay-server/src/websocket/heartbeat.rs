//! Ping/pong liveness tracking.

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

/// Last time a client was heard from.
///
/// Any inbound frame counts, not only pongs.
pub struct Liveness {
    last_seen: Mutex<Instant>,
    timeout: Duration,
}

impl Liveness {
    /// Start tracking now; a client silent for `timeout` is considered dead.
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
            timeout,
        }
    }

    /// Record activity.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the client was last heard from.
    pub fn idle(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Whether the client has been silent too long.
    pub fn is_expired(&self) -> bool {
        self.idle() >= self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expires_after_timeout() {
        let liveness = Liveness::new(Duration::from_secs(90));
        assert!(!liveness.is_expired());

        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(!liveness.is_expired());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(liveness.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_idle_time() {
        let liveness = Liveness::new(Duration::from_secs(90));
        tokio::time::advance(Duration::from_secs(60)).await;
        liveness.mark_alive();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!liveness.is_expired());
        assert_eq!(liveness.idle(), Duration::from_secs(60));
    }
}
