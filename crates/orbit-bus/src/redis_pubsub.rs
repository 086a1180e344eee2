//! Redis pub/sub exchange backend.
//!
//! Each message is published on a channel named after its routing key.
//! Bindings become `PSUBSCRIBE` glob patterns. Redis globs are coarser than
//! topic wildcards (`*` crosses dots), so every received message is checked
//! against the requested bindings before it is handed out.
//!
//! On the wire a message is a MessagePack record carrying the properties and
//! the raw event body.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::topic::{topic_matches, validate_binding};
use crate::traits::{BusError, Delivery, Exchange, Properties, Subscription};

#[derive(Serialize, Deserialize)]
struct WireRecord {
    properties: Properties,
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
}

/// Topic exchange backed by Redis pub/sub.
pub struct RedisExchange {
    client: Client,
    publisher: ConnectionManager,
    healthy: Arc<AtomicBool>,
}

impl RedisExchange {
    /// Connect to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Unreachable`] if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        info!(url = %mask_redis_url(url), "Connecting to Redis");

        let client = Client::open(url)
            .map_err(|e| BusError::Unreachable(format!("Invalid Redis URL: {e}")))?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Unreachable(format!("Redis connection failed: {e}")))?;

        info!("Connected to Redis");
        Ok(Self {
            client,
            publisher,
            healthy: Arc::new(AtomicBool::new(true)),
        })
    }
}

#[async_trait]
impl Exchange for RedisExchange {
    async fn publish(&self, delivery: Delivery) -> Result<(), BusError> {
        let record = WireRecord {
            properties: delivery.properties,
            body: delivery.body.to_vec(),
        };
        let bytes = rmp_serde::to_vec_named(&record).map_err(|e| BusError::Encode(e.to_string()))?;

        let mut conn = self.publisher.clone();
        match conn
            .publish::<_, _, i64>(delivery.routing_key.as_str(), bytes)
            .await
        {
            Ok(receivers) => {
                self.healthy.store(true, Ordering::Relaxed);
                debug!(routing_key = %delivery.routing_key, receivers, "Published to Redis");
                Ok(())
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Relaxed);
                Err(BusError::Unreachable(format!("Redis PUBLISH failed: {e}")))
            }
        }
    }

    async fn subscribe(&self, bindings: &[String]) -> Result<Subscription, BusError> {
        for pattern in bindings {
            validate_binding(pattern)?;
        }

        let mut pubsub = match self.client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                self.healthy.store(false, Ordering::Relaxed);
                return Err(BusError::Unreachable(format!("Redis connection failed: {e}")));
            }
        };

        for pattern in bindings {
            pubsub
                .psubscribe(glob_pattern(pattern))
                .await
                .map_err(|e| BusError::SubscriptionClosed(format!("Redis PSUBSCRIBE failed: {e}")))?;
        }
        self.healthy.store(true, Ordering::Relaxed);
        debug!(?bindings, "Subscribed to Redis");

        let bindings = bindings.to_vec();
        let healthy = Arc::clone(&self.healthy);
        let messages = pubsub
            .into_on_message()
            .filter_map(move |msg| {
                let channel = msg.get_channel_name().to_string();
                let item = if bindings.iter().any(|b| topic_matches(b, &channel)) {
                    Some(decode_record(channel, msg.get_payload_bytes()))
                } else {
                    None
                };
                async move { item }
            })
            .chain(futures_util::stream::once(async move {
                healthy.store(false, Ordering::Relaxed);
                warn!("Redis subscription connection closed");
                None::<Result<Delivery, BusError>>
            }).filter_map(|item| async move { item }));

        Ok(messages.boxed())
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

fn decode_record(routing_key: String, payload: &[u8]) -> Result<Delivery, BusError> {
    let record: WireRecord =
        rmp_serde::from_slice(payload).map_err(|e| BusError::Decode(e.to_string()))?;
    Ok(Delivery {
        routing_key,
        properties: record.properties,
        body: record.body.into(),
    })
}

/// Translate a topic binding into a Redis glob.
///
/// `#` may match zero words, so everything from the first `#` on collapses
/// into one trailing `*`.
fn glob_pattern(binding: &str) -> String {
    let mut glob = String::with_capacity(binding.len());
    for (i, word) in binding.split('.').enumerate() {
        if word == "#" {
            glob.push('*');
            return glob;
        }
        if i > 0 {
            glob.push('.');
        }
        if word == "*" {
            glob.push('*');
            continue;
        }
        for c in word.chars() {
            if matches!(c, '?' | '[' | ']' | '\\' | '*') {
                glob.push('\\');
            }
            glob.push(c);
        }
    }
    glob
}

/// Mask the password in a Redis URL for logging.
fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let scheme_end = url.find("://").map_or(0, |p| p + 3);
            if colon_pos > scheme_end {
                return format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..]);
            }
        }
    }
    url.to_string()
}
