//! TCP listener with an accept-enabled switch.
//!
//! The listener admits connections until [`ListenerHandle::stop`] clears its
//! accept-enabled flag. Stop returns immediately; the accept loop observes it
//! at its next suspension point and yields no further connections, after
//! which the owner drops the listener and the port stops accepting.
//!
//! Concurrent connections are capped with a semaphore: each accepted
//! connection carries a permit that is released when its handler finishes.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Default cap on concurrently open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Pause after a failed accept (e.g. descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Socket-level listener settings.
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    pub backlog: i32,
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Failure to bind the listening socket.
#[derive(Debug)]
pub struct BindError {
    pub addr: SocketAddr,
    pub source: io::Error,
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to bind {}: {}", self.addr, self.source)
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// An accepted connection and its slot under the connection cap.
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub permit: OwnedSemaphorePermit,
}

/// Bound listening socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    accepting: watch::Receiver<bool>,
    handle: ListenerHandle,
    connection_limit: Arc<Semaphore>,
}

/// Cloneable control handle for a [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    accepting: Arc<watch::Sender<bool>>,
}

impl ListenerHandle {
    /// Stop admitting new connections. Returns immediately.
    pub fn stop(&self) {
        if self.accepting.send_replace(false) {
            info!(address = %self.local_addr, "Listener stopped accepting");
        }
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.borrow()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Listener {
    /// Bind `addr` and start listening.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(addr: SocketAddr, config: ListenerConfig) -> Result<Self, BindError> {
        let std_listener =
            create_listener(addr, config.backlog).map_err(|source| BindError { addr, source })?;
        let inner =
            TcpListener::from_std(std_listener).map_err(|source| BindError { addr, source })?;
        let local_addr = inner.local_addr().map_err(|source| BindError { addr, source })?;

        let (tx, accepting) = watch::channel(true);
        let handle = ListenerHandle {
            local_addr,
            accepting: Arc::new(tx),
        };

        info!(address = %local_addr, backlog = config.backlog, "Listening");

        Ok(Self {
            inner,
            local_addr,
            accepting,
            handle,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    /// Wait for the next connection.
    ///
    /// Returns `None` once the listener has been stopped. Accept errors are
    /// logged and do not end the loop.
    pub async fn next_connection(&mut self) -> Option<Accepted> {
        loop {
            if !*self.accepting.borrow() {
                return None;
            }

            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = stopped(&mut self.accepting) => return None,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => permit.ok()?,
            };

            tokio::select! {
                biased;
                _ = stopped(&mut self.accepting) => return None,
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, peer)) => return Some(Accepted { stream, peer, permit }),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }
}

/// Resolves once accept is disabled or the handle is gone.
///
/// The `watch::Ref` from `wait_for` holds a lock and must not outlive this
/// future.
async fn stopped(accepting: &mut watch::Receiver<bool>) {
    let _ = accepting.wait_for(|accepting| !*accepting).await;
}

fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
