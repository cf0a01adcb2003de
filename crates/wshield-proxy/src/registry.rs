//! Live connection tracking
//!
//! Every accepted connection registers here and holds a [`ConnectionGuard`]
//! until its task ends. When the lists change, every registered connection
//! is closed so no tunnel outlives the rules it was admitted under: client
//! sockets are shut down before the change callback returns, and the owning
//! tasks are signalled to drop their upstream side.

use dashmap::DashMap;
use parking_lot::RwLock;
use socket2::{SockRef, Socket};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info};
use wshield_core::{ListChangeListener, ListSnapshot};

/// What is known about one live connection
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    /// Registry id
    pub id: u64,
    /// Client socket address
    pub client_addr: SocketAddr,
    /// Target host, once the request head is parsed
    pub target_host: Option<String>,
    /// Target port, 0 until known
    pub target_port: u16,
    /// CONNECT tunnel rather than a forwarded request
    pub is_tunnel: bool,
    /// Accept time
    pub started_at: Instant,
}

struct Slot {
    info: RwLock<ActiveConnection>,
    cancel: Arc<Notify>,
    /// Duplicate handle on the client socket
    socket: Option<Socket>,
}

/// Concurrent set of live connections
pub struct ConnectionRegistry {
    slots: DashMap<u64, Slot>,
    next_id: AtomicU64,
    closed: AtomicU64,
}

impl ConnectionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicU64::new(0),
        }
    }

    /// Track a connection by address only
    pub fn register(self: &Arc<Self>, client_addr: SocketAddr) -> ConnectionGuard {
        self.insert(client_addr, None)
    }

    /// Track an accepted client socket so a forced close can shut it down directly
    pub fn register_stream(
        self: &Arc<Self>,
        stream: &TcpStream,
        client_addr: SocketAddr,
    ) -> ConnectionGuard {
        let socket = match SockRef::from(stream).try_clone() {
            Ok(socket) => Some(socket),
            Err(e) => {
                debug!(peer = %client_addr, error = %e, "Could not duplicate client socket");
                None
            }
        };
        self.insert(client_addr, socket)
    }

    fn insert(
        self: &Arc<Self>,
        client_addr: SocketAddr,
        socket: Option<Socket>,
    ) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = Arc::new(Notify::new());
        self.slots.insert(
            id,
            Slot {
                info: RwLock::new(ActiveConnection {
                    id,
                    client_addr,
                    target_host: None,
                    target_port: 0,
                    is_tunnel: false,
                    started_at: Instant::now(),
                }),
                cancel: Arc::clone(&cancel),
                socket,
            },
        );
        ConnectionGuard {
            id,
            registry: Arc::clone(self),
            cancel,
        }
    }

    /// Close every live connection, returning how many were closed
    ///
    /// Client sockets are shut down before this returns; each task then
    /// drops its upstream side on its next poll.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for slot in self.slots.iter() {
            if let Some(socket) = &slot.socket {
                if let Err(e) = socket.shutdown(Shutdown::Both) {
                    debug!(id = *slot.key(), error = %e, "Client socket shutdown failed");
                }
            }
            slot.cancel.notify_one();
            closed += 1;
        }
        self.closed.fetch_add(closed as u64, Ordering::Relaxed);
        closed
    }

    /// Copy of the current connection set
    pub fn snapshot(&self) -> Vec<ActiveConnection> {
        let mut list: Vec<ActiveConnection> =
            self.slots.iter().map(|slot| slot.info.read().clone()).collect();
        list.sort_by_key(|c| c.id);
        list
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no connection is live
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Connections closed by [`close_all`](Self::close_all) so far
    pub fn forced_closes(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    fn remove(&self, id: u64) {
        self.slots.remove(&id);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListChangeListener for ConnectionRegistry {
    fn on_list_changed(&self, snapshot: &ListSnapshot) {
        let closed = self.close_all();
        if closed > 0 {
            info!(
                version = snapshot.version,
                closed, "Lists changed, closing live connections"
            );
        }
    }
}

/// Registration handle held by a connection task; deregisters on drop
pub struct ConnectionGuard {
    id: u64,
    registry: Arc<ConnectionRegistry>,
    cancel: Arc<Notify>,
}

impl ConnectionGuard {
    /// Registry id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record the parsed target
    pub fn set_target(&self, host: &str, port: u16, is_tunnel: bool) {
        if let Some(slot) = self.registry.slots.get(&self.id) {
            let mut info = slot.info.write();
            info.target_host = Some(host.to_string());
            info.target_port = port;
            info.is_tunnel = is_tunnel;
        }
    }

    /// Resolves once the registry asks this connection to close
    ///
    /// A signal sent before this is awaited is kept, not lost.
    pub async fn cancelled(&self) {
        self.cancel.notified().await;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        debug!(id = self.id, "Connection deregistered");
    }
}
