//! TCP echo server.
//!
//! Accepts connections, hands each one to its own handler task, and runs the
//! shutdown sequence once the stop signal fires.

use crate::config::Config;
use crate::connection::ConnectionRegistry;
use crate::handler::{handle_connection, HandlerConfig};
use crate::listener::{Accepted, BindError, Listener, ListenerConfig, ListenerHandle};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Server instance
pub struct Server {
    listener: Listener,
    registry: Arc<ConnectionRegistry>,
    coordinator: ShutdownCoordinator,
    handler_config: HandlerConfig,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(
        addr: SocketAddr,
        listener_config: ListenerConfig,
        handler_config: HandlerConfig,
        grace: Duration,
    ) -> Result<Self, BindError> {
        Ok(Server {
            listener: Listener::start(addr, listener_config)?,
            registry: ConnectionRegistry::new(),
            coordinator: ShutdownCoordinator::new(grace),
            handler_config,
        })
    }

    /// Bind using a resolved [`Config`].
    pub fn from_config(config: &Config, addr: SocketAddr) -> Result<Self, BindError> {
        Self::bind(
            addr,
            config.listener_config(),
            config.handler_config(),
            config.shutdown_grace,
        )
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Handle for stopping the listener without shutting the server down.
    pub fn listener_handle(&self) -> ListenerHandle {
        self.listener.handle()
    }

    /// Registry of active connections.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serve connections until `signal` completes, then drain.
    ///
    /// Stopping the listener through its handle closes the port but leaves
    /// existing connections running until `signal` fires.
    pub async fn run_until<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            registry,
            coordinator,
            handler_config,
        } = self;
        let handle = listener.handle();
        let mut listener = Some(listener);
        let mut tasks = JoinSet::new();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received");
                    break;
                }

                next = accept(&mut listener) => match next {
                    Some(Accepted { stream, peer, permit }) => {
                        let guard = registry.register(peer);
                        let conn_id = guard.connection().id;
                        debug!(conn_id, peer = %peer, active = registry.len(), "New connection");

                        let shutdown = coordinator.subscribe();
                        tasks.spawn(async move {
                            let summary =
                                handle_connection(stream, guard, handler_config, shutdown).await;
                            trace!(
                                conn_id = summary.id,
                                state = ?summary.final_state,
                                frames = summary.frames_echoed,
                                peak_queued = summary.peak_queued_bytes,
                                pauses = summary.read_pauses,
                                "Handler finished"
                            );
                            drop(permit);
                        });
                    }
                    None => {
                        // Dropping the socket refuses further connects
                        listener = None;
                        info!(active = registry.len(), "Listener closed");
                    }
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        drop(listener);
        let report = coordinator.shutdown(&handle, tasks, &registry).await;
        info!(
            drained = report.drained,
            forced = report.forced,
            "Server stopped"
        );
        report
    }
}

/// Next accepted connection, or pending forever once the listener is gone.
async fn accept(listener: &mut Option<Listener>) -> Option<Accepted> {
    match listener {
        Some(listener) => listener.next_connection().await,
        None => std::future::pending().await,
    }
}
