//! # orbit-protocol
//!
//! Wire types for the Orbit presence service.
//!
//! This crate defines everything that crosses a process boundary: the socket
//! frames exchanged with clients, the presence event envelope carried on the
//! message bus, and the codecs for both.
//!
//! ## Events
//!
//! - `LOGGED_IN` / `LOGGED_OUT` - Connection lifecycle reported by the client
//! - `USER_STATUS` - Presence status changes
//! - `USER_NOTIFICATIONS` - Circle subscription requests and notification pings
//!
//! ## Example
//!
//! ```rust
//! use orbit_protocol::{codec, EventName, Frame, NotificationsData};
//!
//! let data = NotificationsData {
//!     subscribed_user_uid: "u1".into(),
//!     should_receive: true,
//! };
//! let frame = Frame::with_data(EventName::UserNotifications, &data).unwrap();
//!
//! let text = codec::encode_text(&frame).unwrap();
//! let decoded = codec::decode_text(&text).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use events::{
    now_millis, Identity, InboundEvent, NotificationsData, PresenceEvent, PresenceState,
    StatusRecord, UserProfile, UserStatusData,
};
pub use frames::{EventName, Frame};
