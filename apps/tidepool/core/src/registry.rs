use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::gauge;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::error::{RegistryError, TransportError};
use crate::protocol::ChannelMessage;

pub const DEFAULT_CONNECTION_BUFFER: usize = 64;
pub const DEFAULT_ROOM: &str = "default";

/// Identity of a registered connection. Ids are handed out in registration
/// order and never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending half of a connection's outbound queue plus its identity.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<ChannelMessage>,
    dropped: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a message, waiting at most `timeout` for buffer space.
    pub async fn deliver(
        &self,
        message: ChannelMessage,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.sender
            .send_timeout(message, timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => TransportError::TimedOut(timeout),
                SendTimeoutError::Closed(_) => TransportError::Closed,
            })
    }

    pub fn try_deliver(&self, message: ChannelMessage) -> Result<(), TransportError> {
        self.sender.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::Broken("outbound buffer full".into()),
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the registry has dropped this connection, including
    /// when the drop happened before this call.
    pub async fn dropped(&self) {
        self.dropped.notified().await;
    }
}

/// Result of [`SessionRegistry::connect`]: the handle the registry keeps and
/// the queue the transport writer drains.
pub struct Registration {
    pub handle: ConnectionHandle,
    pub receiver: mpsc::Receiver<ChannelMessage>,
    pub active_connections: usize,
}

/// The live connections of one relay room.
///
/// All mutations and snapshots go through one mutex that is never held across
/// an await, so iteration always sees a consistent set.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    next_id: AtomicU64,
    per_connection_buffer: usize,
    connections: Mutex<BTreeMap<ConnectionId, ConnectionHandle>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_BUFFER)
    }
}

impl SessionRegistry {
    pub fn new(per_connection_buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                per_connection_buffer: per_connection_buffer.max(1),
                connections: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Create an outbound queue and register it in one step.
    pub fn connect(&self) -> Registration {
        let (tx, rx) = mpsc::channel(self.inner.per_connection_buffer);
        let mut guard = self.inner.connections.lock();
        let handle = self.insert_locked(&mut guard, tx);
        Registration {
            handle,
            receiver: rx,
            active_connections: guard.len(),
        }
    }

    /// Register an existing channel. A channel may be registered only once.
    pub fn register(
        &self,
        sender: mpsc::Sender<ChannelMessage>,
    ) -> Result<ConnectionHandle, RegistryError> {
        let mut guard = self.inner.connections.lock();
        if let Some(existing) = guard
            .values()
            .find(|handle| handle.sender.same_channel(&sender))
        {
            return Err(RegistryError::AlreadyRegistered(existing.id));
        }
        Ok(self.insert_locked(&mut guard, sender))
    }

    fn insert_locked(
        &self,
        guard: &mut BTreeMap<ConnectionId, ConnectionHandle>,
        sender: mpsc::Sender<ChannelMessage>,
    ) -> ConnectionHandle {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = ConnectionHandle {
            id,
            sender,
            dropped: Arc::new(Notify::new()),
        };
        guard.insert(id, handle.clone());
        debug!(connection_id = %id, active = guard.len(), "connection registered");
        handle
    }

    /// Remove a connection. Returns `false` when it was not registered, so
    /// exactly one caller observes the removal.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.inner.connections.lock().remove(&id);
        match removed {
            Some(handle) => {
                handle.dropped.notify_one();
                debug!(connection_id = %id, "connection unregistered");
                true
            }
            None => false,
        }
    }

    /// Whether both handles point at the same registry instance. Ids are
    /// only unique within one instance.
    pub fn same_registry(&self, other: &SessionRegistry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.connections.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.lock().is_empty()
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner.connections.lock().keys().copied().collect()
    }

    /// Snapshot of every connection except `id`, in registration order.
    pub fn peers_except(&self, id: ConnectionId) -> Vec<ConnectionHandle> {
        self.inner
            .connections
            .lock()
            .values()
            .filter(|handle| handle.id != id)
            .cloned()
            .collect()
    }

    /// Visit every connection except `id`. Works on a snapshot; connections
    /// whose channel has already closed are skipped.
    pub fn for_each_except<F>(&self, id: ConnectionId, mut f: F)
    where
        F: FnMut(&ConnectionHandle),
    {
        for peer in self.peers_except(id) {
            if peer.is_closed() {
                continue;
            }
            f(&peer);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room: String,
    pub connections: usize,
}

/// Named relay rooms, each backed by its own [`SessionRegistry`].
#[derive(Clone)]
pub struct RoomDirectory {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    rooms: DashMap<String, SessionRegistry>,
    per_connection_buffer: usize,
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECTION_BUFFER)
    }
}

impl RoomDirectory {
    pub fn new(per_connection_buffer: usize) -> Self {
        Self {
            inner: Arc::new(DirectoryInner {
                rooms: DashMap::new(),
                per_connection_buffer,
            }),
        }
    }

    /// Register a new connection in `room`, creating the room on demand.
    pub fn join(&self, room: &str) -> (SessionRegistry, Registration) {
        // Registering under the entry guard keeps `leave` from dropping the
        // room between lookup and registration.
        let entry = self
            .inner
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| SessionRegistry::new(self.inner.per_connection_buffer));
        let registry = entry.value().clone();
        let registration = registry.connect();
        drop(entry);

        gauge!(
            "tidepool_connections_active",
            registration.active_connections as f64,
            "room" => room.to_string()
        );
        (registry, registration)
    }

    /// Unregister a connection from the registry it joined and drop the room
    /// once that registry is empty. A room recreated under the same name is a
    /// different registry and is left alone. Returns the number of
    /// connections left in `registry`.
    pub fn leave(&self, room: &str, registry: &SessionRegistry, id: ConnectionId) -> usize {
        registry.unregister(id);
        let remaining = registry.len();
        if self
            .inner
            .rooms
            .remove_if(room, |_, current| {
                current.same_registry(registry) && current.is_empty()
            })
            .is_some()
        {
            debug!(room, "room closed");
        }

        gauge!(
            "tidepool_connections_active",
            remaining as f64,
            "room" => room.to_string()
        );
        remaining
    }

    pub fn room(&self, room: &str) -> Option<SessionRegistry> {
        self.inner.rooms.get(room).map(|entry| entry.value().clone())
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    /// Rooms sorted by name with their connection counts.
    pub fn snapshot(&self) -> Vec<RoomSnapshot> {
        let registries: Vec<(String, SessionRegistry)> = self
            .inner
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let mut rooms: Vec<RoomSnapshot> = registries
            .into_iter()
            .map(|(room, registry)| RoomSnapshot {
                room,
                connections: registry.len(),
            })
            .collect();
        rooms.sort_by(|a, b| a.room.cmp(&b.room));
        rooms
    }
}
