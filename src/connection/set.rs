//! The set of live connections and the handler-facing view onto it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, warn};

use super::handle::{CloseReason, ConnectionHandle, ConnectionId};

/// Every accepted connection that has not been closed yet, keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly accepted connection. Ids are allocated by the event
    /// loop and never repeat, so a clash means a bookkeeping bug.
    pub(crate) fn insert(&mut self, handle: ConnectionHandle) {
        let id = handle.id();
        let previous = self.connections.insert(id, handle);
        debug_assert!(previous.is_none(), "connection id {} inserted twice", id);
    }

    /// Remove a connection. Dropping the returned handle closes the socket.
    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionHandle> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.connections.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionHandle> {
        self.connections.values_mut()
    }

    /// Ids of connections in the `Closing` state.
    pub(crate) fn closing_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.is_closing())
            .map(|c| c.id())
            .collect()
    }

    /// Mark every connection for closing with the same reason.
    pub(crate) fn mark_all_closing(&mut self, reason: CloseReason) {
        for connection in self.connections.values_mut() {
            connection.mark_closing(reason.clone());
        }
    }
}

/// What a protocol handler may do with connections.
///
/// Handlers only ever see ids. Sends and closes take effect inside the event
/// loop: queued bytes go out when the socket is writable, and closes happen at
/// the end of the current cycle.
pub struct Control<'a> {
    connections: &'a mut ConnectionSet,
}

impl<'a> Control<'a> {
    pub(crate) fn new(connections: &'a mut ConnectionSet) -> Self {
        Self { connections }
    }

    /// Queue `data` for `id`. Returns false if the connection is gone or
    /// already closing.
    pub fn send(&mut self, id: ConnectionId, data: &[u8]) -> bool {
        match self.connections.get_mut(id) {
            Some(connection) if !connection.is_closing() => {
                connection.enqueue(data);
                true
            }
            Some(_) => {
                debug!("Dropping {} bytes for closing connection {}", data.len(), id);
                false
            }
            None => {
                warn!("Send to unknown connection {}", id);
                false
            }
        }
    }

    /// Ask for `id` to be closed at the end of the cycle. Already queued bytes
    /// get one final flush attempt.
    pub fn close(&mut self, id: ConnectionId) -> bool {
        self.close_with(id, CloseReason::Requested)
    }

    pub(crate) fn close_with(&mut self, id: ConnectionId, reason: CloseReason) -> bool {
        match self.connections.get_mut(id) {
            Some(connection) => {
                connection.mark_closing(reason);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains(id)
    }

    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(id).map(|c| c.peer_addr())
    }

    pub fn last_activity(&self, id: ConnectionId) -> Option<Instant> {
        self.connections.get(id).map(|c| c.last_activity())
    }

    pub fn queued_bytes(&self, id: ConnectionId) -> Option<usize> {
        self.connections.get(id).map(|c| c.queued_bytes())
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.ids()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
