//! In-flight client/origin connection pairs.
//!
//! The table is the only place a [`Connection`] lives while no worker is
//! servicing it. A worker checks a connection out before touching its sockets
//! and checks it back in afterwards; while checked out the entry keeps only
//! its socket handles so that `remove` can still close them.

use crate::models::ProxyTarget;
use crate::proxy::io;
use bytes::BytesMut;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketRole {
    Client,
    Peer,
}

/// Identifies one registered socket: which connection owns it and in which role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketHandle {
    pub connection: ConnectionId,
    pub role: SocketRole,
}

/// A socket handed out in a readiness snapshot
#[derive(Debug, Clone)]
pub struct RegisteredSocket {
    pub handle: SocketHandle,
    pub stream: Arc<TcpStream>,
}

/// Per-connection state machine.
///
/// `Accepted -> ReadingRequest -> {CacheHitServed | Forwarding -> ReadingResponse | Tunneling} -> Closed`.
/// Any state may go straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Accepted,
    ReadingRequest,
    CacheHitServed,
    Forwarding,
    ReadingResponse,
    Tunneling,
    Closed,
}

impl ConnectionState {
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Accepted, ReadingRequest) => true,
            (ReadingRequest, ReadingRequest) => true,
            (ReadingRequest, CacheHitServed | Forwarding | Tunneling) => true,
            (Forwarding, ReadingResponse) => true,
            _ => false,
        }
    }
}

/// One client socket and, once resolved, its origin socket
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub client: Arc<TcpStream>,
    pub client_addr: SocketAddr,
    pub peer: Option<Arc<TcpStream>>,
    /// Request bytes until forwarded, then the response retained for caching
    pub buffer: BytesMut,
    pub target: Option<ProxyTarget>,
    pub method: Option<String>,
    state: ConnectionState,
    /// The response is still a candidate for the cache
    pub cacheable: bool,
    /// The client finished sending; its socket is no longer watched
    pub client_eof: bool,
    pub bytes_to_client: u64,
    pub accepted_at: Instant,
    pub last_activity: Instant,
}

impl Connection {
    pub fn new(id: ConnectionId, client: TcpStream, client_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            client: Arc::new(client),
            client_addr,
            peer: None,
            buffer: BytesMut::new(),
            target: None,
            method: None,
            state: ConnectionState::Accepted,
            cacheable: false,
            client_eof: false,
            bytes_to_client: 0,
            accepted_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`, refusing transitions the state machine does not allow
    pub fn advance(&mut self, next: ConnectionState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            warn!(
                "Connection {} refused transition {:?} -> {:?}",
                self.id, self.state, next
            );
            false
        }
    }

    /// Attach the origin socket. Set at most once.
    pub fn attach_peer(&mut self, peer: TcpStream) -> bool {
        if self.peer.is_some() {
            return false;
        }
        self.peer = Some(Arc::new(peer));
        true
    }

    /// Whether `role` names a socket this connection currently has
    pub fn has_socket(&self, role: SocketRole) -> bool {
        match role {
            SocketRole::Client => true,
            SocketRole::Peer => self.peer.is_some(),
        }
    }

    /// Shut both sockets down and mark the connection closed
    pub fn close(&mut self) {
        io::close(&self.client);
        if let Some(peer) = &self.peer {
            io::close(peer);
        }
        self.state = ConnectionState::Closed;
    }
}

/// Read-only view returned by [`ConnectionTable::find`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: SocketRole,
    pub client_addr: SocketAddr,
    pub state: Option<ConnectionState>,
    pub target: Option<ProxyTarget>,
    pub busy: bool,
}

enum Slot {
    Idle(Connection),
    /// Checked out by a worker; the sockets stay reachable for `remove`
    Busy {
        client: Arc<TcpStream>,
        client_addr: SocketAddr,
        peer: Option<Arc<TcpStream>>,
    },
}

/// Set of in-flight connections, guarded by one short-held lock.
/// Network I/O never happens while the lock is held.
#[derive(Default)]
pub struct ConnectionTable {
    slots: Mutex<HashMap<ConnectionId, Slot>>,
    next_id: AtomicU64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a connection keyed by its id
    pub fn add(&self, connection: Connection) {
        let id = connection.id;
        if self.lock().insert(id, Slot::Idle(connection)).is_some() {
            warn!("Connection {} registered twice, previous entry replaced", id);
        }
    }

    /// Wrap a freshly accepted socket in a connection and register it
    pub fn register(&self, client: TcpStream, client_addr: SocketAddr) -> ConnectionId {
        let id = self.next_id();
        self.add(Connection::new(id, client, client_addr));
        id
    }

    /// Close every socket owned by the connection and drop it. Idempotent.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let slot = self.lock().remove(&id);
        match slot {
            Some(Slot::Idle(mut connection)) => {
                connection.close();
                true
            }
            Some(Slot::Busy { client, peer, .. }) => {
                io::close(&client);
                if let Some(peer) = &peer {
                    io::close(peer);
                }
                true
            }
            None => false,
        }
    }

    /// Drop the entry without closing its sockets; the caller now owns them
    pub fn detach(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Snapshot of every watched socket of connections not currently checked out
    pub fn get_sockets(&self) -> Vec<RegisteredSocket> {
        let slots = self.lock();
        let mut sockets = Vec::with_capacity(slots.len() * 2);
        for slot in slots.values() {
            let Slot::Idle(connection) = slot else { continue };
            if !connection.client_eof {
                sockets.push(RegisteredSocket {
                    handle: SocketHandle { connection: connection.id, role: SocketRole::Client },
                    stream: Arc::clone(&connection.client),
                });
            }
            if let Some(peer) = &connection.peer {
                sockets.push(RegisteredSocket {
                    handle: SocketHandle { connection: connection.id, role: SocketRole::Peer },
                    stream: Arc::clone(peer),
                });
            }
        }
        sockets
    }

    /// Locate the connection owning a client or peer socket
    pub fn find(&self, handle: SocketHandle) -> Option<ConnectionInfo> {
        let slots = self.lock();
        match slots.get(&handle.connection)? {
            Slot::Idle(connection) if connection.has_socket(handle.role) => Some(ConnectionInfo {
                id: connection.id,
                role: handle.role,
                client_addr: connection.client_addr,
                state: Some(connection.state),
                target: connection.target.clone(),
                busy: false,
            }),
            Slot::Busy { client_addr, peer, .. }
                if handle.role == SocketRole::Client || peer.is_some() =>
            {
                Some(ConnectionInfo {
                    id: handle.connection,
                    role: handle.role,
                    client_addr: *client_addr,
                    state: None,
                    target: None,
                    busy: true,
                })
            }
            _ => None,
        }
    }

    /// Take exclusive use of a connection for one dispatch.
    /// Returns `None` when it is gone, already checked out, or lacks that socket.
    pub fn checkout(&self, handle: SocketHandle) -> Option<Connection> {
        let mut slots = self.lock();
        let slot = slots.get_mut(&handle.connection)?;
        let busy = match &*slot {
            Slot::Idle(connection) if connection.has_socket(handle.role) => Slot::Busy {
                client: Arc::clone(&connection.client),
                client_addr: connection.client_addr,
                peer: connection.peer.clone(),
            },
            _ => return None,
        };
        match std::mem::replace(slot, busy) {
            Slot::Idle(connection) => Some(connection),
            Slot::Busy { .. } => None,
        }
    }

    /// Return a checked-out connection. If it was removed meanwhile, its sockets are closed.
    pub fn checkin(&self, mut connection: Connection) -> bool {
        {
            let mut slots = self.lock();
            if let Some(slot) = slots.get_mut(&connection.id) {
                if matches!(slot, Slot::Busy { .. }) {
                    *slot = Slot::Idle(connection);
                    return true;
                }
            }
        }
        debug!("Connection {} was removed while in service", connection.id);
        connection.close();
        false
    }

    /// Idle connections in the response phase whose origin has been silent past `limit`
    pub fn stalled_responses(&self, limit: Duration) -> Vec<SocketHandle> {
        let now = Instant::now();
        self.lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Idle(c)
                    if c.state == ConnectionState::ReadingResponse
                        && now.duration_since(c.last_activity) > limit =>
                {
                    Some(SocketHandle { connection: c.id, role: SocketRole::Peer })
                }
                _ => None,
            })
            .collect()
    }

    /// Remove and close every registered connection
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.lock().keys().copied().collect();
        ids.into_iter().filter(|id| self.remove(*id)).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
