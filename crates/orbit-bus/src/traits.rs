//! Message bus abstraction traits for Orbit.
//!
//! These traits define the interface every bus backend must provide, so the
//! publisher and receiver stay backend-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata attached to every published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    /// Application that published the message.
    pub app_id: String,
    /// Publish time in epoch milliseconds.
    pub timestamp: u64,
    /// Instance that published the message.
    pub origin: String,
}

/// A message as it travels through the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Routing key, `<prefix>.<topic>`.
    pub routing_key: String,
    /// Publish metadata.
    pub properties: Properties,
    /// Serialized presence event envelope.
    pub body: Bytes,
}

/// Stream of deliveries for one subscription.
///
/// The stream ends when the backend loses its connection.
pub type Subscription = BoxStream<'static, Result<Delivery, BusError>>;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus could not be reached.
    #[error("Bus unreachable: {0}")]
    Unreachable(String),

    /// The bus refused the message.
    #[error("Publish rejected: {0}")]
    Rejected(String),

    /// A subscription broke.
    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    /// The message could not be serialized.
    #[error("Encoding error: {0}")]
    Encode(String),

    /// A received message could not be read. The subscription is still usable.
    #[error("Decoding error: {0}")]
    Decode(String),

    /// A binding pattern is not valid.
    #[error("Invalid binding: {0}")]
    InvalidBinding(String),
}

/// A topic exchange.
///
/// Published messages are delivered to every live subscription with a binding
/// pattern matching the routing key.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Publish a message.
    ///
    /// Failures are returned to the caller, never swallowed here.
    async fn publish(&self, delivery: Delivery) -> Result<(), BusError>;

    /// Open a subscription receiving messages matching any of `bindings`.
    async fn subscribe(&self, bindings: &[String]) -> Result<Subscription, BusError>;

    /// Get the backend name (e.g., "memory", "redis").
    fn name(&self) -> &'static str;

    /// Check if the backend is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}
