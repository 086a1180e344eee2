//! Outbound messages and connection handles.
//!
//! A connection handle is the only thing the registry keeps per connection:
//! the identity it was admitted with and the queue feeding its socket writer.

use orbit_protocol::{now_millis, EventName, Identity};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// A unique message identifier.
pub type MessageId = u64;

/// A connection identifier, unique within the process.
pub type ConnectionId = String;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    nanos().wrapping_add(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Generate a unique connection ID.
#[must_use]
pub fn generate_connection_id() -> ConnectionId {
    format!(
        "conn_{:x}_{:x}",
        nanos(),
        ID_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// A message emitted to the members of a room.
#[derive(Debug, Clone)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Room the message was broadcast to.
    pub room: String,
    /// Event name.
    pub event: EventName,
    /// Payload, shared between all recipients.
    pub payload: Arc<serde_json::Value>,
    /// Timestamp when the message was created.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message.
    #[must_use]
    pub fn new(
        room: impl Into<String>,
        event: EventName,
        payload: Arc<serde_json::Value>,
    ) -> Self {
        Self {
            id: generate_message_id(),
            room: room.into(),
            event,
            payload,
            timestamp: now_millis(),
        }
    }
}

/// Handle to an admitted connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    sender: mpsc::UnboundedSender<Arc<Message>>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(
        id: impl Into<ConnectionId>,
        identity: Identity,
    ) -> (Self, mpsc::UnboundedReceiver<Arc<Message>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            id: id.into(),
            identity,
            sender,
        };
        (handle, receiver)
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the identity attached at handshake.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue a message for the socket writer.
    ///
    /// Never waits. Returns `false` if the writer has gone away.
    pub fn send(&self, message: Arc<Message>) -> bool {
        self.sender.send(message).is_ok()
    }

    /// Check if the socket writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::new(
            "u1-circle",
            EventName::UserStatus,
            Arc::new(serde_json::json!({ "state": "ONLINE" })),
        );
        assert_eq!(msg.room, "u1-circle");
        assert_eq!(msg.event, EventName::UserStatus);
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn test_unique_ids() {
        assert_ne!(generate_message_id(), generate_message_id());

        let id = generate_connection_id();
        assert!(id.starts_with("conn_"));
        assert_ne!(id, generate_connection_id());
    }

    #[test]
    fn test_handle_send_after_receiver_dropped() {
        let (handle, rx) = ConnectionHandle::new("conn-1", Identity::new("u1", "ash", "a@x"));
        let msg = Arc::new(Message::new(
            "u1",
            EventName::UserStatus,
            Arc::new(serde_json::Value::Null),
        ));

        assert!(handle.send(msg.clone()));
        drop(rx);
        assert!(handle.is_closed());
        assert!(!handle.send(msg));
    }
}
