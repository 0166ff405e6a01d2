//! Shutdown coordination.
//!
//! The [`ShutdownCoordinator`] owns the process-wide stop signal. Shutdown
//! runs in a fixed order:
//!
//! 1. stop the listener so no new connections are admitted,
//! 2. broadcast stop to every connection handler,
//! 3. wait for handlers to flush and close, bounded by the grace period,
//! 4. abort whatever is still running and report it as force-closed.
//!
//! Handlers observe the broadcast through a [`Shutdown`] receiver at their
//! next suspension point.

use crate::connection::ConnectionRegistry;
use crate::listener::ListenerHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Default time handlers get to drain after stop is broadcast.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Per-handler view of the stop signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(notify: watch::Receiver<bool>) -> Self {
        let is_shutdown = *notify.borrow();
        Self {
            is_shutdown,
            notify,
        }
    }

    /// Whether stop has already been observed.
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Wait for the stop signal.
    ///
    /// Cancel safe. A dropped coordinator counts as stop.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.wait_for(|stop| *stop).await;
        self.is_shutdown = true;
    }
}

/// Outcome of a completed shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Handlers that finished within the grace period.
    pub drained: usize,
    /// Handlers aborted after the grace period elapsed.
    pub forced: usize,
}

/// Owner of the stop broadcast.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    notify: watch::Sender<bool>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (notify, _) = watch::channel(false);
        Self { notify, grace }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Subscribe a handler to the stop signal.
    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.notify.subscribe())
    }

    /// Whether stop has been broadcast.
    pub fn is_triggered(&self) -> bool {
        *self.notify.borrow()
    }

    /// Broadcast stop to every subscribed handler.
    pub fn trigger(&self) {
        self.notify.send_replace(true);
    }

    /// Run the full shutdown sequence over the given handler tasks.
    pub async fn shutdown(
        &self,
        listener: &ListenerHandle,
        mut tasks: JoinSet<()>,
        registry: &ConnectionRegistry,
    ) -> ShutdownReport {
        listener.stop();
        self.trigger();

        let in_flight = tasks.len();
        info!(
            connections = in_flight,
            grace_ms = self.grace.as_millis() as u64,
            "Draining connections"
        );

        let mut report = ShutdownReport::default();
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Connection task failed");
                }
                report.drained += 1;
            }
        };

        if tokio::time::timeout(self.grace, drain).await.is_err() {
            for info in registry.snapshot() {
                warn!(
                    conn_id = info.id,
                    peer = %info.peer,
                    accepted_at = %info.accepted_at,
                    "Force closing connection"
                );
            }

            report.forced = tasks.len();
            tasks.shutdown().await;
            warn!(forced = report.forced, "Grace period elapsed, connections force closed");
        }

        // Aborted guards deregister on drop
        registry.wait_empty().await;
        debug!(in_flight, drained = report.drained, forced = report.forced, "Shutdown complete");
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Listener, ListenerConfig};
    use crate::logging::capture::CapturedLogs;
    use std::net::SocketAddr;

    #[tokio::test]
    async fn test_recv_after_trigger() {
        let coordinator = ShutdownCoordinator::default();
        let mut shutdown = coordinator.subscribe();
        assert!(!shutdown.is_shutdown());

        coordinator.trigger();
        assert!(coordinator.is_triggered());
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());

        // Returns immediately once observed
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_stop() {
        let coordinator = ShutdownCoordinator::default();
        coordinator.trigger();
        let shutdown = coordinator.subscribe();
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_dropped_coordinator_counts_as_stop() {
        let coordinator = ShutdownCoordinator::default();
        let mut shutdown = coordinator.subscribe();
        drop(coordinator);
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_pending_until_triggered() {
        let coordinator = ShutdownCoordinator::default();
        let mut shutdown = coordinator.subscribe();
        let waited =
            tokio::time::timeout(Duration::from_millis(20), shutdown.recv()).await;
        assert!(waited.is_err());
        assert!(!shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn test_drain_log_counts_connections_at_stop() {
        let logs = CapturedLogs::default();
        let _logging = logs.install();

        let listener =
            Listener::start(SocketAddr::from(([127, 0, 0, 1], 0)), ListenerConfig::default())
                .unwrap();
        let registry = ConnectionRegistry::new();
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));

        // Handlers that close the instant stop is broadcast
        let mut tasks = JoinSet::new();
        for port in 0..3 {
            let guard = registry.register(SocketAddr::from(([127, 0, 0, 1], 50000 + port)));
            let mut shutdown = coordinator.subscribe();
            tasks.spawn(async move {
                shutdown.recv().await;
                drop(guard);
            });
        }
        tokio::task::yield_now().await;

        let report = coordinator.shutdown(&listener.handle(), tasks, &registry).await;
        assert_eq!(report, ShutdownReport { drained: 3, forced: 0 });

        let draining = logs.lines_containing("Draining connections");
        assert_eq!(draining.len(), 1);
        assert!(draining[0].contains("connections=3"));
    }
}
