//! Connection state machine and the registry of active connections.
//!
//! Each accepted socket is described by a [`Connection`] owned by its handler
//! task. The listener-wide [`ConnectionRegistry`] records which connections
//! are still open so shutdown can wait for them to drain. Registration is
//! tied to a [`ConnectionGuard`], which removes the entry exactly once when
//! the handler finishes, fails, or is aborted.

use chrono::{DateTime, Utc};
use slab::Slab;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

/// Unique identifier assigned to every accepted connection.
pub type ConnectionId = u64;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket handed off by the listener.
    Accepted,
    /// Waiting for inbound bytes.
    Reading,
    /// Echo frames are queued for the peer.
    Writing,
    /// Peer finished or shutdown requested; flushing pending writes.
    Closing,
    /// Socket closed and resources released.
    Closed,
    /// Aborted after a decode or I/O failure.
    Error,
}

impl ConnState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Error)
    }
}

/// A single peer connection.
#[derive(Debug)]
pub struct Connection {
    /// Identifier used in logs and in the registry.
    pub id: ConnectionId,
    /// Remote address of the peer.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub accepted_at: DateTime<Utc>,
    state: ConnState,
}

impl Connection {
    /// Create a new connection in the accepted state.
    pub fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            accepted_at: Utc::now(),
            state: ConnState::Accepted,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Move to `next`.
    ///
    /// Transitions out of a terminal state are ignored, and `Closing` can
    /// only be left for `Closed` or `Error`.
    pub fn transition(&mut self, next: ConnState) {
        if self.state == next || self.state.is_terminal() {
            return;
        }
        if self.state == ConnState::Closing && !next.is_terminal() {
            return;
        }
        trace!(conn_id = self.id, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }

    /// Milliseconds since the connection was accepted.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.accepted_at).num_milliseconds()
    }
}

/// Registry entry describing one active connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub accepted_at: DateTime<Utc>,
}

/// Set of active connections, shared between the listener and handlers.
///
/// Backed by a mutex-guarded slab for O(1) insert and remove.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Mutex<Slab<ConnectionInfo>>,
    next_id: AtomicU64,
    emptied: Notify,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a newly accepted connection.
    ///
    /// The returned guard deregisters the connection when dropped.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Connection::new(id, peer);
        let key = self.lock().insert(ConnectionInfo {
            id,
            peer,
            accepted_at: conn.accepted_at,
        });

        ConnectionGuard {
            registry: Arc::clone(self),
            key,
            conn,
        }
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every active entry.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.lock().iter().map(|(_, info)| info.clone()).collect()
    }

    /// Wait until no connections remain registered.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.emptied.notified();
            tokio::pin!(notified);
            // Register interest before checking to avoid a lost wakeup
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn remove(&self, key: usize) {
        let now_empty = {
            let mut entries = self.lock();
            entries.try_remove(key);
            entries.is_empty()
        };
        if now_empty {
            self.emptied.notify_waiters();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<ConnectionInfo>> {
        // A panicking handler cannot leave the slab half-updated
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ownership of one registry entry plus the connection it describes.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    key: usize,
    conn: Connection,
}

impl ConnectionGuard {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if !self.conn.state.is_terminal() {
            // Aborted mid-flight
            self.conn.transition(ConnState::Error);
        }
        self.registry.remove(self.key);
        trace!(conn_id = self.conn.id, "Connection deregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_connection_state_transitions() {
        let mut conn = Connection::new(1, addr(1000));
        assert_eq!(conn.state(), ConnState::Accepted);

        conn.transition(ConnState::Reading);
        conn.transition(ConnState::Writing);
        assert_eq!(conn.state(), ConnState::Writing);
        conn.transition(ConnState::Reading);
        assert_eq!(conn.state(), ConnState::Reading);

        conn.transition(ConnState::Closing);
        // Closing cannot go back to reading
        conn.transition(ConnState::Reading);
        assert_eq!(conn.state(), ConnState::Closing);

        conn.transition(ConnState::Closed);
        conn.transition(ConnState::Error);
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_error_is_terminal() {
        let mut conn = Connection::new(1, addr(1000));
        conn.transition(ConnState::Reading);
        conn.transition(ConnState::Error);
        conn.transition(ConnState::Closing);
        assert_eq!(conn.state(), ConnState::Error);
    }

    #[test]
    fn test_connection_registry() {
        let registry = ConnectionRegistry::new();

        let g1 = registry.register(addr(1));
        let g2 = registry.register(addr(2));
        assert_eq!(registry.len(), 2);
        assert_ne!(g1.connection().id, g2.connection().id);

        let mut peers: Vec<_> = registry.snapshot().into_iter().map(|i| i.peer).collect();
        peers.sort();
        assert_eq!(peers, vec![addr(1), addr(2)]);

        drop(g1);
        assert_eq!(registry.len(), 1);
        drop(g2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let registry = ConnectionRegistry::new();
        let first = registry.register(addr(1)).connection().id;
        let second = registry.register(addr(1)).connection().id;
        assert_ne!(first, second);
    }

    #[test]
    fn test_dropped_guard_deregisters() {
        let registry = ConnectionRegistry::new();
        let mut guard = registry.register(addr(1));
        guard.connection_mut().transition(ConnState::Reading);
        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let registry = ConnectionRegistry::new();
        registry.wait_empty().await;

        let guard = registry.register(addr(1));
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_empty().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_register_and_remove() {
        let registry = ConnectionRegistry::new();
        let mut tasks = Vec::new();
        for port in 0..64u16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let guard = registry.register(addr(port));
                tokio::task::yield_now().await;
                drop(guard);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(registry.is_empty());
    }
}
