//! Ordered teardown of the gateway and the relay behind it.
//!
//! Stopping runs in three steps:
//!
//! 1. the token is cancelled, so `/ws` refuses upgrades, the HTTP server
//!    stops accepting, and open sockets start closing;
//! 2. the relay shuts down, closing the broker session and every channel
//!    outbox and refusing any later connect;
//! 3. the serve and session tasks are awaited, up to a deadline.

use std::sync::Arc;
use std::time::Duration;

use keyrelay_relay::Relay;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long tasks get to finish once the relay is down.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the server is in its teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Serving normally.
    Running,
    /// Token cancelled; relay and tasks are being torn down.
    Stopping,
    /// Relay closed and tasks awaited.
    Stopped,
}

/// Owns the shutdown token and the order in which the relay and the
/// server's tasks are stopped.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    relay: Arc<Relay>,
    phase: Mutex<ShutdownPhase>,
}

impl ShutdownCoordinator {
    /// A coordinator for the server fronting `relay`.
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            token: CancellationToken::new(),
            relay,
            phase: Mutex::new(ShutdownPhase::Running),
        }
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the token without touching the relay.
    ///
    /// Sockets close and the server stops accepting; the broker session
    /// stays up until [`ShutdownCoordinator::stop`].
    pub fn cancel(&self) {
        self.token.cancel();
        let mut phase = self.phase.lock();
        if *phase == ShutdownPhase::Running {
            *phase = ShutdownPhase::Stopping;
        }
    }

    /// Whether the token has been cancelled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Current phase.
    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.lock()
    }

    /// Stop everything in order: cancel, shut the relay down, then wait up to
    /// `timeout` (default [`DEFAULT_SHUTDOWN_TIMEOUT`]) for `tasks`.
    ///
    /// Calls after the first only wait on their own `tasks`.
    pub async fn stop(&self, tasks: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.cancel();
        info!("shutdown: refusing new clients");

        self.relay.shutdown().await;
        info!("shutdown: relay closed");

        let count = tasks.len();
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(?timeout, tasks = count, "shutdown: tasks still running at deadline");
        }
        *self.phase.lock() = ShutdownPhase::Stopped;
        info!(tasks = count, "shutdown: complete");
    }
}
