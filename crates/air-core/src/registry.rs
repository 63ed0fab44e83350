//! Connection registry.
//!
//! The registry is the only state shared between sessions and the
//! dispatcher. Connections are indexed by room name, and each room's
//! membership map sits behind its own reader/writer lock (one `DashMap`
//! entry per room): lookups and snapshots take the read side, register and
//! unregister take the write side, so a query observes a connection either
//! fully registered or not at all.

use air_protocol::UserInfo;
use air_transport::{ConnectionId, FrameSink, TransportError};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The connection is already registered.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),
}

/// Caller-supplied identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// User id.
    pub user_id: String,
    /// Display name.
    pub name: String,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// One live participant: its room, identity and write half.
pub struct ConnectionHandle {
    id: ConnectionId,
    room: String,
    identity: Identity,
    sink: Arc<dyn FrameSink>,
    connected_at: Instant,
}

impl ConnectionHandle {
    /// Create a handle with a freshly generated connection id.
    #[must_use]
    pub fn new(room: impl Into<String>, identity: Identity, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            id: ConnectionId::generate(),
            room: room.into(),
            identity,
            sink,
            connected_at: Instant::now(),
        }
    }

    /// The connection id.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// The room this connection is bound to.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// The caller-supplied identity.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The identity as a `userlist` entry.
    #[must_use]
    pub fn user_info(&self) -> UserInfo {
        UserInfo::new(&self.identity.user_id, &self.identity.name)
    }

    /// Time since the handle was created.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Write a text frame to this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport write fails.
    pub async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.sink.send_text(data).await
    }

    /// Answer a ping on this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport write fails.
    pub async fn pong(&self, payload: Bytes) -> Result<(), TransportError> {
        self.sink.send_pong(payload).await
    }

    /// Whether the transport still accepts writes.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sink.is_open()
    }

    /// Close the underlying transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails while closing.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.sink.close().await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("room", &self.room)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// The set of live connections, partitioned by room.
#[derive(Default)]
pub struct Registry {
    rooms: DashMap<String, HashMap<ConnectionId, Arc<ConnectionHandle>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; it is visible to routing as soon as this returns.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the same connection id
    /// is already present.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> Result<(), RegistryError> {
        let mut members = self.rooms.entry(handle.room().to_string()).or_default();
        if members.contains_key(handle.id()) {
            return Err(RegistryError::AlreadyRegistered(handle.id().clone()));
        }
        members.insert(handle.id().clone(), Arc::clone(&handle));

        debug!(
            room = %handle.room(),
            connection = %handle.id(),
            user = %handle.identity().user_id,
            members = members.len(),
            "Registered connection"
        );
        Ok(())
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let removed = match self.rooms.get_mut(handle.room()) {
            Some(mut members) => members.remove(handle.id()).is_some(),
            None => false,
        };

        if removed {
            // Drop the room entry only if nobody registered in the meantime.
            self.rooms
                .remove_if(handle.room(), |_, members| members.is_empty());
            debug!(
                room = %handle.room(),
                connection = %handle.id(),
                user = %handle.identity().user_id,
                "Unregistered connection"
            );
        }
        removed
    }

    /// Current participants of a room.
    #[must_use]
    pub fn list_by_room(&self, room: &str) -> Vec<UserInfo> {
        self.rooms
            .get(room)
            .map(|members| members.values().map(|h| h.user_info()).collect())
            .unwrap_or_default()
    }

    /// Find a connection in a room by user id.
    ///
    /// If several connections share the user id, any one of them is returned.
    #[must_use]
    pub fn find_by_room_and_id(&self, room: &str, user_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.rooms.get(room).and_then(|members| {
            members
                .values()
                .find(|h| h.identity().user_id == user_id)
                .cloned()
        })
    }

    /// Look up a connection by its connection id.
    #[must_use]
    pub fn get(&self, room: &str, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.rooms
            .get(room)
            .and_then(|members| members.get(id).cloned())
    }

    /// Snapshot of every connection in a room.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<Arc<ConnectionHandle>> {
        self.rooms
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            connection_count: self.rooms.iter().map(|m| m.len()).sum(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    /// Rooms with at least one connection.
    pub room_count: usize,
    /// Live connections.
    pub connection_count: usize,
}
