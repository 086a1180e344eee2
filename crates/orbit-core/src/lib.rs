//! # orbit-core
//!
//! Per-instance presence machinery for the Orbit service.
//!
//! This crate provides the building blocks that never leave the process:
//!
//! - **Room** - Circle and identity rooms grouping connections
//! - **Registry** - Connection registration, join/leave and local fan-out
//! - **Presence** - The sticky presence state machine and status tracker
//! - **Auth** - The token validator interface consumed at handshake
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Registry   │────▶│    Room     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            ▲
//!                            │ broadcast
//!                     ┌─────────────┐
//!                     │  Presence   │
//!                     └─────────────┘
//! ```
//!
//! Room membership is local to one process. Instances converge through the
//! message bus (see `orbit-bus`), never through shared memory.

pub mod auth;
pub mod message;
pub mod presence;
pub mod registry;
pub mod room;

pub use auth::{AuthError, TokenValidator};
pub use message::{generate_connection_id, ConnectionHandle, ConnectionId, Message};
pub use presence::{transition, PresenceSink, PresenceTracker, PresenceTrigger, Transition};
pub use registry::{LocalBroadcast, RegistryConfig, RegistryError, RegistryStats, RoomRegistry};
pub use room::{circle_room, identity_room, Room, RoomId};
