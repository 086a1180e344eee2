//! Presence event types.
//!
//! These are the payloads carried inside socket frames and the envelope
//! published on the message bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An authenticated user, as decoded from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user id.
    pub uid: String,
    /// Display name.
    pub username: String,
    /// Account email.
    pub email: String,
}

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(
        uid: impl Into<String>,
        username: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            username: username.into(),
            email: email.into(),
        }
    }
}

/// Presence state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceState {
    Online,
    Offline,
    AppearAway,
    AppearBusy,
    AppearOffline,
}

impl PresenceState {
    /// States that survive automatic login/logout transitions.
    pub const STICKY: [PresenceState; 3] = [
        PresenceState::AppearAway,
        PresenceState::AppearBusy,
        PresenceState::AppearOffline,
    ];

    /// Whether only an explicit status set may leave this state.
    #[must_use]
    pub fn is_sticky(self) -> bool {
        Self::STICKY.contains(&self)
    }

    /// Get the wire name of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PresenceState::Online => "ONLINE",
            PresenceState::Offline => "OFFLINE",
            PresenceState::AppearAway => "APPEAR_AWAY",
            PresenceState::AppearBusy => "APPEAR_BUSY",
            PresenceState::AppearOffline => "APPEAR_OFFLINE",
        }
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest known status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    /// Current presence state.
    pub state: PresenceState,
    /// When the state was last changed, in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
}

impl StatusRecord {
    /// Create a record stamped with the given time.
    #[must_use]
    pub fn new(state: PresenceState, last_seen: u64) -> Self {
        Self {
            state,
            last_seen: Some(last_seen),
        }
    }
}

/// Payload of `USER_STATUS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusData {
    /// Whether the user picked this status explicitly.
    #[serde(default)]
    pub is_hard_update: bool,
    /// The status itself.
    pub status: StatusRecord,
}

/// Payload of an inbound `USER_NOTIFICATIONS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsData {
    /// Subject whose circle to join or leave.
    pub subscribed_user_uid: String,
    /// `true` joins the circle, `false` leaves it.
    pub should_receive: bool,
}

/// Payload of `LOGGED_IN`: the user profile.
///
/// Only `status` is interpreted; everything else is passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Status the user last had, if the client knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusRecord>,
    /// Remaining profile fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Shape of an inbound frame payload.
///
/// Clients also send a `from` member, which is ignored: the sender is always
/// the identity attached to the connection at handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent<T> {
    /// Event data.
    pub data: T,
}

/// The presence event envelope.
///
/// This is both the outbound socket payload and the message bus body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent<T> {
    /// User the event is about.
    pub from: Identity,
    /// Event data.
    pub data: T,
    /// User-initiated change, as opposed to one derived from connectivity.
    #[serde(default)]
    pub is_hard_update: bool,
    /// Creation time in epoch milliseconds.
    #[serde(default)]
    pub timestamp: u64,
}

impl<T> PresenceEvent<T> {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(from: Identity, data: T, is_hard_update: bool) -> Self {
        Self {
            from,
            data,
            is_hard_update,
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> Identity {
        Identity::new("u1", "ash", "ash@example.com")
    }

    #[test]
    fn test_sticky_states() {
        assert!(PresenceState::AppearAway.is_sticky());
        assert!(PresenceState::AppearBusy.is_sticky());
        assert!(PresenceState::AppearOffline.is_sticky());
        assert!(!PresenceState::Online.is_sticky());
        assert!(!PresenceState::Offline.is_sticky());
    }

    #[test]
    fn test_status_event_wire_shape() {
        let data = UserStatusData {
            is_hard_update: true,
            status: StatusRecord::new(PresenceState::AppearBusy, 1_700_000_000_000),
        };
        let mut event = PresenceEvent::new(identity(), data, true);
        event.timestamp = 1_700_000_000_001;

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "from": { "uid": "u1", "username": "ash", "email": "ash@example.com" },
                "data": {
                    "isHardUpdate": true,
                    "status": { "state": "APPEAR_BUSY", "lastSeen": 1_700_000_000_000u64 }
                },
                "isHardUpdate": true,
                "timestamp": 1_700_000_000_001u64
            })
        );
    }

    #[test]
    fn test_envelope_requires_from() {
        let body = json!({ "data": {}, "isHardUpdate": false, "timestamp": 1 });
        assert!(serde_json::from_value::<PresenceEvent<serde_json::Value>>(body).is_err());
    }

    #[test]
    fn test_status_without_last_seen() {
        let status: StatusRecord = serde_json::from_value(json!({ "state": "ONLINE" })).unwrap();
        assert_eq!(status.state, PresenceState::Online);
        assert_eq!(status.last_seen, None);
    }

    #[test]
    fn test_profile_keeps_unknown_fields() {
        let profile: UserProfile = serde_json::from_value(json!({
            "displayName": "Ash",
            "status": { "state": "APPEAR_AWAY", "lastSeen": 5 }
        }))
        .unwrap();

        assert_eq!(
            profile.status,
            Some(StatusRecord::new(PresenceState::AppearAway, 5))
        );
        assert_eq!(profile.extra.get("displayName"), Some(&json!("Ash")));
    }
}
