//! Frame types for the Orbit socket protocol.
//!
//! A frame pairs an event name with a JSON payload. The payload schema depends
//! on the event and is decoded by the handler the event is dispatched to.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::codec::ProtocolError;
use crate::events::InboundEvent;

/// Protocol event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventName {
    /// Client finished logging in.
    LoggedIn,
    /// Client logged out without closing the transport.
    LoggedOut,
    /// Presence status change.
    UserStatus,
    /// Circle subscription request (inbound) or notification ping (outbound).
    UserNotifications,
}

impl EventName {
    /// All event names, in declaration order.
    pub const ALL: [EventName; 4] = [
        EventName::LoggedIn,
        EventName::LoggedOut,
        EventName::UserStatus,
        EventName::UserNotifications,
    ];

    /// Get the wire name of the event.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventName::LoggedIn => "LOGGED_IN",
            EventName::LoggedOut => "LOGGED_OUT",
            EventName::UserStatus => "USER_STATUS",
            EventName::UserNotifications => "USER_NOTIFICATIONS",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEvent(s.to_string()))
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Event name used for dispatch.
    pub event: EventName,
    /// Event payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Frame {
    /// Create a frame from an already-built payload.
    #[must_use]
    pub fn new(event: EventName, payload: serde_json::Value) -> Self {
        Self { event, payload }
    }

    /// Create a frame whose payload is `{ "data": <data> }`, the shape clients send.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be represented as JSON.
    pub fn with_data<T: Serialize>(event: EventName, data: &T) -> Result<Self, ProtocolError> {
        let data = serde_json::to_value(data)?;
        Ok(Self::new(event, serde_json::json!({ "data": data })))
    }

    /// Decode the `data` member of an inbound payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the expected schema.
    pub fn inbound_data<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let event: InboundEvent<T> = serde_json::from_value(self.payload.clone())?;
        Ok(event.data)
    }
}
