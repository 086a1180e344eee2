//! Shared fixtures for the Orbit benchmarks.

use bytes::Bytes;
use orbit_bus::{Delivery, Properties};
use orbit_core::{ConnectionHandle, Message, RoomRegistry};
use orbit_protocol::{EventName, Frame, Identity, PresenceEvent, PresenceState, StatusRecord, UserStatusData};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

/// Identity for a numbered benchmark user.
#[must_use]
pub fn identity(i: usize) -> Identity {
    Identity::new(format!("u{i}"), format!("user-{i}"), format!("u{i}@example.com"))
}

/// A hard `USER_STATUS` event for user 0.
#[must_use]
pub fn status_event(state: PresenceState) -> PresenceEvent<UserStatusData> {
    PresenceEvent::new(
        identity(0),
        UserStatusData {
            is_hard_update: true,
            status: StatusRecord::new(state, 1_700_000_000_000),
        },
        true,
    )
}

/// An outbound `USER_STATUS` frame as written to sockets.
#[must_use]
pub fn status_frame() -> Frame {
    let payload = serde_json::to_value(status_event(PresenceState::AppearBusy))
        .unwrap_or_default();
    Frame::new(EventName::UserStatus, payload)
}

/// A bus delivery carrying a status event for user 0.
#[must_use]
pub fn status_delivery(origin: &str) -> Delivery {
    let body = serde_json::to_vec(&status_event(PresenceState::Online)).unwrap_or_default();
    Delivery {
        routing_key: "events.USER_STATUS".to_string(),
        properties: Properties {
            app_id: "orbit".to_string(),
            timestamp: 1_700_000_000_000,
            origin: origin.to_string(),
        },
        body: Bytes::from(body),
    }
}

/// A registry where `followers` connections follow user 0.
///
/// The returned receivers must be kept alive for the followers to count.
#[must_use]
pub fn followed_registry(followers: usize) -> (Arc<RoomRegistry>, Vec<UnboundedReceiver<Arc<Message>>>) {
    let registry = Arc::new(RoomRegistry::new());
    let receivers = (0..followers)
        .map(|i| {
            let id = format!("conn-{i}");
            let (handle, rx) = ConnectionHandle::new(id.clone(), identity(i + 1));
            registry.register(handle);
            let _ = registry.join_circle(&id, "u0");
            rx
        })
        .collect();
    (registry, receivers)
}
