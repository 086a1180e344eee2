//! # orbit-bus
//!
//! Cross-instance presence fan-out for Orbit.
//!
//! Every Orbit instance keeps its own room table. Instances converge by
//! publishing presence events to a shared topic exchange and rebroadcasting
//! whatever they consume to their own local rooms:
//!
//! ```text
//!  instance A                 exchange                 instance B
//! ┌───────────┐  publish   ┌────────────┐  deliver   ┌───────────┐
//! │ Publisher │───────────▶│ events.*   │───────────▶│ Receiver  │
//! └───────────┘            └────────────┘            └─────┬─────┘
//!                                                          │ broadcast
//!                                                    ┌─────▼─────┐
//!                                                    │ Registry  │
//!                                                    └───────────┘
//! ```
//!
//! Backends implement the [`Exchange`] trait:
//!
//! - **memory** - In-process topic exchange for single-node deployments and tests
//! - **redis** - Redis pub/sub with pattern subscriptions (feature `redis`)
//!
//! Delivery is at-least-once at best. Presence events are idempotent, so a
//! duplicate rebroadcast is harmless.

pub mod backoff;
pub mod memory;
pub mod metrics;
pub mod publisher;
pub mod receiver;
pub mod topic;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis_pubsub;

pub use backoff::ExponentialBackoff;
pub use memory::MemoryExchange;
pub use publisher::{EventPublisher, PublisherConfig};
pub use receiver::{Dropped, EventReceiver, ReceiverConfig};
pub use topic::{routing_key, topic_matches};
pub use traits::{BusError, Delivery, Exchange, Properties, Subscription};

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisExchange;

/// Generate an identifier for this process, stamped on every publish.
#[must_use]
pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
