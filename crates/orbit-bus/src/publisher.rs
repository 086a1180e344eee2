//! Event publisher.

use bytes::Bytes;
use orbit_protocol::{now_millis, EventName, PresenceEvent};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::topic::routing_key;
use crate::traits::{BusError, Delivery, Exchange, Properties};

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// First word of every routing key.
    pub routing_prefix: String,
    /// Application id stamped on every message.
    pub app_id: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            routing_prefix: "events".to_string(),
            app_id: "orbit".to_string(),
        }
    }
}

/// Serializes presence events and publishes them to the exchange.
#[derive(Clone)]
pub struct EventPublisher {
    exchange: Arc<dyn Exchange>,
    config: PublisherConfig,
    instance_id: String,
}

impl EventPublisher {
    /// Create a publisher for this instance.
    #[must_use]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        config: PublisherConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            config,
            instance_id: instance_id.into(),
        }
    }

    /// Id of the instance this publisher stamps on messages.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Publish an event under `<prefix>.<topic>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized or the exchange
    /// does not take it.
    pub async fn publish<T: Serialize>(
        &self,
        topic: EventName,
        event: &PresenceEvent<T>,
    ) -> Result<(), BusError> {
        let body = serde_json::to_vec(event).map_err(|e| BusError::Encode(e.to_string()))?;
        let delivery = Delivery {
            routing_key: routing_key(&self.config.routing_prefix, topic),
            properties: Properties {
                app_id: self.config.app_id.clone(),
                timestamp: now_millis(),
                origin: self.instance_id.clone(),
            },
            body: Bytes::from(body),
        };

        let key = delivery.routing_key.clone();
        match self.exchange.publish(delivery).await {
            Ok(()) => {
                crate::metrics::record_published(topic.as_str());
                debug!(routing_key = %key, uid = %event.from.uid, "Published presence event");
                Ok(())
            }
            Err(e) => {
                crate::metrics::record_publish_failure(topic.as_str());
                warn!(routing_key = %key, error = %e, "Publish failed");
                Err(e)
            }
        }
    }
}
