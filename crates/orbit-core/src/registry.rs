//! Circle room registry and local broadcaster.
//!
//! The registry tracks which admitted connections are joined to which rooms in
//! this process, and emits events to a room's members. It never coordinates
//! with other instances; cross-instance visibility comes from the message bus
//! feeding [`LocalBroadcast::broadcast`] on every instance.

use crate::message::{ConnectionHandle, ConnectionId, Message};
use crate::room::{circle_room, validate_room_name, Room, RoomId};
use dashmap::DashMap;
use orbit_protocol::EventName;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The connection was never admitted or has already been removed.
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Maximum rooms per connection reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
    /// Whether to drop rooms once their last member leaves.
    pub auto_delete_empty_rooms: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: 256,
            auto_delete_empty_rooms: true,
        }
    }
}

/// Emits an event to every connection joined to a room in this process.
pub trait LocalBroadcast: Send + Sync {
    /// Broadcast `payload` as `event` to the members of `room`.
    ///
    /// Must not wait on any recipient. Returns the number of recipients.
    fn broadcast(&self, room: &str, event: EventName, payload: Arc<serde_json::Value>) -> usize;
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    rooms: HashSet<RoomId>,
}

/// The per-instance room table.
pub struct RoomRegistry {
    /// Rooms indexed by name.
    rooms: DashMap<RoomId, Room>,
    /// Admitted connections and the rooms each one joined.
    connections: DashMap<ConnectionId, ConnectionEntry>,
    /// Configuration.
    config: RegistryConfig,
}

impl RoomRegistry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            connections: DashMap::new(),
            config,
        }
    }

    /// Number of rooms with at least one member.
    ///
    /// Cheap enough for every join and leave, unlike [`RoomRegistry::stats`].
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            connection_count: self.connections.len(),
            total_memberships: self.connections.iter().map(|c| c.rooms.len()).sum(),
        }
    }

    /// Register an admitted connection.
    ///
    /// Only registered connections can join rooms.
    pub fn register(&self, handle: ConnectionHandle) {
        debug!(connection = %handle.id(), uid = %handle.identity().uid, "Registered connection");
        self.connections.insert(
            handle.id().to_string(),
            ConnectionEntry {
                handle,
                rooms: HashSet::new(),
            },
        );
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn is_registered(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Join a connection to a room.
    ///
    /// Returns `true` if the connection was not already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid, the connection is not
    /// registered, or it already sits in the maximum number of rooms.
    pub fn join(&self, connection_id: &str, room_name: &str) -> Result<bool, RegistryError> {
        validate_room_name(room_name).map_err(RegistryError::InvalidRoom)?;

        let mut conn = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.to_string()))?;

        if conn.rooms.contains(room_name) {
            return Ok(false);
        }

        if conn.rooms.len() >= self.config.max_rooms_per_connection {
            return Err(RegistryError::MaxRoomsReached);
        }

        let handle = conn.handle.clone();
        conn.rooms.insert(room_name.to_string());

        let mut room = self
            .rooms
            .entry(room_name.to_string())
            .or_insert_with(|| {
                debug!(room = %room_name, "Creating new room");
                Room::new(room_name)
            });
        room.join(handle);

        debug!(
            room = %room_name,
            connection = %connection_id,
            members = room.member_count(),
            "Joined"
        );

        Ok(true)
    }

    /// Join a connection to `subject_uid`'s circle room.
    ///
    /// # Errors
    ///
    /// See [`RoomRegistry::join`].
    pub fn join_circle(&self, connection_id: &str, subject_uid: &str) -> Result<bool, RegistryError> {
        self.join(connection_id, &circle_room(subject_uid))
    }

    /// Remove a connection from a room.
    ///
    /// Leaving a room that was not joined is a no-op. Returns `true` if the
    /// connection was a member.
    pub fn leave(&self, connection_id: &str, room_name: &str) -> bool {
        let was_member = match self.connections.get_mut(connection_id) {
            Some(mut conn) => conn.rooms.remove(room_name),
            None => false,
        };

        if was_member {
            self.leave_room(connection_id, room_name);
        }

        was_member
    }

    /// Remove a connection from `subject_uid`'s circle room.
    pub fn leave_circle(&self, connection_id: &str, subject_uid: &str) -> bool {
        self.leave(connection_id, &circle_room(subject_uid))
    }

    /// Unregister a connection and remove it from every room it joined.
    ///
    /// Returns the handle if the connection was registered.
    pub fn remove_connection(&self, connection_id: &str) -> Option<ConnectionHandle> {
        let (_, entry) = self.connections.remove(connection_id)?;

        for room_name in &entry.rooms {
            self.leave_room(connection_id, room_name);
        }

        debug!(connection = %connection_id, rooms = entry.rooms.len(), "Removed connection");
        Some(entry.handle)
    }

    fn leave_room(&self, connection_id: &str, room_name: &str) {
        if let Some(mut room) = self.rooms.get_mut(room_name) {
            room.leave(connection_id);
            trace!(
                room = %room_name,
                connection = %connection_id,
                members = room.member_count(),
                "Left"
            );
        }

        if self.config.auto_delete_empty_rooms
            && self.rooms.remove_if(room_name, |_, room| room.is_empty()).is_some()
        {
            debug!(room = %room_name, "Deleted empty room");
        }
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room_name: &str) -> bool {
        self.rooms.contains_key(room_name)
    }

    /// Get the member count of a room.
    #[must_use]
    pub fn member_count(&self, room_name: &str) -> usize {
        self.rooms
            .get(room_name)
            .map(|room| room.member_count())
            .unwrap_or(0)
    }

    /// Check if a connection is joined to a room.
    #[must_use]
    pub fn is_member(&self, connection_id: &str, room_name: &str) -> bool {
        self.rooms
            .get(room_name)
            .is_some_and(|room| room.is_member(connection_id))
    }

    /// Get the rooms a connection is joined to.
    #[must_use]
    pub fn connection_rooms(&self, connection_id: &str) -> Vec<RoomId> {
        self.connections
            .get(connection_id)
            .map(|conn| conn.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl LocalBroadcast for RoomRegistry {
    fn broadcast(&self, room: &str, event: EventName, payload: Arc<serde_json::Value>) -> usize {
        let Some(entry) = self.rooms.get(room) else {
            trace!(room = %room, event = %event, "Broadcast to empty room");
            return 0;
        };

        let message = Arc::new(Message::new(room, event, payload));
        let count = entry.broadcast(&message);
        trace!(room = %room, event = %event, recipients = count, "Broadcast");
        count
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of non-empty rooms.
    pub room_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Total number of room memberships.
    pub total_memberships: usize,
}
