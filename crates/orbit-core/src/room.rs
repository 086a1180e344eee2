//! Room abstraction for Orbit.
//!
//! Rooms are local groupings of connections. Every user has an identity room
//! (all of their own devices) and a circle room (everyone watching them).

use crate::message::{ConnectionHandle, ConnectionId, Message};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Suffix appended to a subject uid to form its circle room.
pub const CIRCLE_SUFFIX: &str = "-circle";

/// A room identifier.
pub type RoomId = String;

/// Room holding everyone interested in `subject_uid`'s presence.
#[must_use]
pub fn circle_room(subject_uid: &str) -> RoomId {
    format!("{subject_uid}{CIRCLE_SUFFIX}")
}

/// Room holding every connection of `uid` itself.
#[must_use]
pub fn identity_room(uid: &str) -> RoomId {
    uid.to_string()
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// A room and its current members.
#[derive(Debug)]
pub struct Room {
    name: RoomId,
    members: HashMap<ConnectionId, ConnectionHandle>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(name: impl Into<RoomId>) -> Self {
        Self {
            name: name.into(),
            members: HashMap::new(),
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn is_member(&self, connection_id: &str) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Add a connection to this room.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn join(&mut self, handle: ConnectionHandle) -> bool {
        let conn_id = handle.id().to_string();
        let joined = self.members.insert(conn_id.clone(), handle).is_none();
        if joined {
            debug!(room = %self.name, connection = %conn_id, "Connection joined");
        }
        joined
    }

    /// Remove a connection from this room.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&mut self, connection_id: &str) -> bool {
        let removed = self.members.remove(connection_id).is_some();
        if removed {
            debug!(room = %self.name, connection = %connection_id, "Connection left");
        }
        removed
    }

    /// Queue a message on every member's outbound queue.
    ///
    /// Returns the number of members the message was queued for.
    pub fn broadcast(&self, message: &Arc<Message>) -> usize {
        trace!(room = %self.name, event = %message.event, "Broadcasting message");
        self.members
            .values()
            .filter(|handle| handle.send(Arc::clone(message)))
            .count()
    }

    /// Get all member connection IDs.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.keys().cloned().collect()
    }

    /// Check if the room is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_protocol::{EventName, Identity};

    fn handle(id: &str) -> (ConnectionHandle, tokio::sync::mpsc::UnboundedReceiver<Arc<Message>>) {
        ConnectionHandle::new(id, Identity::new("u2", "misty", "misty@example.com"))
    }

    #[test]
    fn test_room_names() {
        assert_eq!(circle_room("u1"), "u1-circle");
        assert_eq!(identity_room("u1"), "u1");
    }

    #[test]
    fn test_room_name_validation() {
        assert!(validate_room_name("u1-circle").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("bad\nname").is_err());

        let long_name = "a".repeat(MAX_ROOM_NAME_LENGTH + 1);
        assert!(validate_room_name(&long_name).is_err());
    }

    #[test]
    fn test_room_join_leave() {
        let mut room = Room::new("u1-circle");
        let (h1, _rx1) = handle("conn-1");
        let (h2, _rx2) = handle("conn-2");

        assert!(room.join(h1.clone()));
        assert!(!room.join(h1));
        assert!(room.join(h2));
        assert_eq!(room.member_count(), 2);

        assert!(room.leave("conn-1"));
        assert!(!room.is_member("conn-1"));

        // Leaving twice is a no-op
        assert!(!room.leave("conn-1"));
        assert_eq!(room.member_count(), 1);
    }

    #[test]
    fn test_room_broadcast_skips_closed_members() {
        let mut room = Room::new("u1-circle");
        let (h1, mut rx1) = handle("conn-1");
        let (h2, rx2) = handle("conn-2");
        room.join(h1);
        room.join(h2);
        drop(rx2);

        let msg = Arc::new(Message::new(
            "u1-circle",
            EventName::UserStatus,
            Arc::new(serde_json::json!({ "state": "ONLINE" })),
        ));

        assert_eq!(room.broadcast(&msg), 1);
        assert_eq!(rx1.try_recv().unwrap().id, msg.id);
    }
}
