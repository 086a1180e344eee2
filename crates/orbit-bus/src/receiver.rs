//! Event receiver.
//!
//! The receiver holds one long-lived subscription and rebroadcasts every
//! presence event it consumes to the subject's local circle room, through the
//! same [`LocalBroadcast`] path the originating instance uses for its own
//! clients. It never publishes, so an event looping back to its origin is
//! emitted locally once more and goes no further.
//!
//! `USER_STATUS` deliveries are also recorded in the local presence tracker,
//! so a connectivity change on this instance cannot override a sticky state
//! the user picked on another one.

use dashmap::DashMap;
use futures_util::StreamExt;
use orbit_core::{circle_room, LocalBroadcast, PresenceSink};
use orbit_protocol::{EventName, PresenceEvent, UserStatusData};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::ExponentialBackoff;
use crate::topic::{default_bindings, topic_of};
use crate::traits::{BusError, Delivery, Exchange};

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Binding patterns to subscribe with.
    pub bindings: Vec<String>,
    /// Drop deliveries published by this instance.
    pub skip_own_events: bool,
    /// Drop `USER_STATUS` deliveries older than the newest one already
    /// rebroadcast for the same subject.
    pub reject_stale_events: bool,
    /// How long a subject stays in the stale guard after its newest event.
    pub stale_window: Duration,
    /// First reconnect delay.
    pub reconnect_min: Duration,
    /// Largest reconnect delay.
    pub reconnect_max: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bindings: default_bindings("events"),
            skip_own_events: false,
            reject_stale_events: false,
            stale_window: Duration::from_secs(300),
            reconnect_min: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Guard size that triggers the first eviction sweep.
const STALE_SWEEP_LEN: usize = 4096;

/// Why a delivery was not rebroadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dropped {
    /// Published by this instance and `skip_own_events` is on.
    OwnEvent,
    /// Routing key names no known topic.
    UnknownTopic,
    /// Body is not a presence event envelope.
    Malformed,
    /// Older than an event already rebroadcast for the subject.
    Stale,
}

impl Dropped {
    fn label(self) -> &'static str {
        match self {
            Dropped::OwnEvent => "own_event",
            Dropped::UnknownTopic => "unknown_topic",
            Dropped::Malformed => "malformed",
            Dropped::Stale => "stale",
        }
    }
}

/// Consumes presence events from the exchange and fans them out locally.
pub struct EventReceiver {
    exchange: Arc<dyn Exchange>,
    sink: Arc<dyn LocalBroadcast>,
    instance_id: String,
    config: ReceiverConfig,
    presence: Option<Arc<dyn PresenceSink>>,
    newest: DashMap<String, u64>,
    high_water: AtomicU64,
    sweep_at: AtomicUsize,
}

impl EventReceiver {
    /// Create a receiver rebroadcasting into `sink`.
    #[must_use]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        sink: Arc<dyn LocalBroadcast>,
        instance_id: impl Into<String>,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            exchange,
            sink,
            instance_id: instance_id.into(),
            config,
            presence: None,
            newest: DashMap::new(),
            high_water: AtomicU64::new(0),
            sweep_at: AtomicUsize::new(STALE_SWEEP_LEN),
        }
    }

    /// Also record received statuses in `presence`.
    #[must_use]
    pub fn with_presence(mut self, presence: Arc<dyn PresenceSink>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Run until `cancel` fires.
    ///
    /// Lost subscriptions are re-established with exponential backoff. While
    /// disconnected this instance misses its peers' events but keeps serving
    /// its own clients.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff =
            ExponentialBackoff::new(self.config.reconnect_min, self.config.reconnect_max);
        let mut attempts: u64 = 0;

        loop {
            if attempts > 0 {
                crate::metrics::record_resubscribe();
            }
            attempts += 1;

            let subscribed = tokio::select! {
                result = self.exchange.subscribe(&self.config.bindings) => result,
                () = cancel.cancelled() => break,
            };

            match subscribed {
                Ok(mut subscription) => {
                    info!(
                        backend = self.exchange.name(),
                        bindings = ?self.config.bindings,
                        "Bus subscription established"
                    );
                    backoff.reset();

                    loop {
                        let item = tokio::select! {
                            biased;
                            () = cancel.cancelled() => return,
                            item = subscription.next() => item,
                        };

                        match item {
                            Some(Ok(delivery)) => {
                                let _ = self.handle_delivery(&delivery);
                            }
                            Some(Err(BusError::Decode(e))) => {
                                warn!(error = %e, "Dropping undecodable bus message");
                                crate::metrics::record_dropped(Dropped::Malformed.label());
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Bus subscription failed");
                                break;
                            }
                            None => {
                                warn!("Bus subscription ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, backend = self.exchange.name(), "Bus subscribe failed");
                }
            }

            let delay = backoff.next_delay();
            warn!(delay_ms = delay.as_millis() as u64, "Resubscribing to bus");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => break,
            }
        }

        debug!("Bus receiver stopped");
    }

    /// Rebroadcast one delivery to the subject's local circle room.
    ///
    /// Returns the number of local recipients, or why the delivery was dropped.
    pub fn handle_delivery(&self, delivery: &Delivery) -> Result<usize, Dropped> {
        self.route(delivery).map_err(|reason| {
            crate::metrics::record_dropped(reason.label());
            reason
        })
    }

    fn route(&self, delivery: &Delivery) -> Result<usize, Dropped> {
        if self.config.skip_own_events && delivery.properties.origin == self.instance_id {
            trace!(routing_key = %delivery.routing_key, "Skipping own event");
            return Err(Dropped::OwnEvent);
        }

        let topic: EventName = topic_of(&delivery.routing_key).parse().map_err(|_| {
            warn!(routing_key = %delivery.routing_key, "Dropping message with unknown topic");
            Dropped::UnknownTopic
        })?;

        let payload: serde_json::Value = serde_json::from_slice(&delivery.body).map_err(|e| {
            warn!(routing_key = %delivery.routing_key, error = %e, "Dropping malformed message");
            Dropped::Malformed
        })?;
        let envelope: PresenceEvent<serde_json::Value> = serde_json::from_value(payload.clone())
            .map_err(|e| {
                warn!(routing_key = %delivery.routing_key, error = %e, "Dropping malformed message");
                Dropped::Malformed
            })?;

        if topic == EventName::UserStatus {
            let data: UserStatusData = serde_json::from_value(envelope.data).map_err(|e| {
                warn!(routing_key = %delivery.routing_key, error = %e, "Dropping malformed status");
                Dropped::Malformed
            })?;
            if self.config.reject_stale_events {
                self.admit_newest(&envelope.from.uid, envelope.timestamp)?;
            }
            if let Some(presence) = &self.presence {
                presence.observe(&envelope.from.uid, data.status);
            }
        }

        let room = circle_room(&envelope.from.uid);
        let count = self.sink.broadcast(&room, topic, Arc::new(payload));
        crate::metrics::record_delivery(topic.as_str());
        debug!(
            room = %room,
            event = %topic,
            origin = %delivery.properties.origin,
            recipients = count,
            "Rebroadcast bus event"
        );
        Ok(count)
    }

    fn admit_newest(&self, uid: &str, timestamp: u64) -> Result<(), Dropped> {
        {
            let mut newest = self.newest.entry(uid.to_string()).or_insert(timestamp);
            if timestamp < *newest {
                debug!(uid = %uid, timestamp, newest = *newest, "Dropping stale status event");
                return Err(Dropped::Stale);
            }
            *newest = timestamp;
        }

        let high_water = self.high_water.fetch_max(timestamp, Ordering::Relaxed).max(timestamp);
        if self.newest.len() >= self.sweep_at.load(Ordering::Relaxed) {
            self.evict_quiet_subjects(high_water);
        }
        Ok(())
    }

    /// Forget subjects with no status event inside the stale window.
    ///
    /// The next sweep waits until the guard has doubled, so subjects that
    /// are all still active do not cause a sweep on every event.
    fn evict_quiet_subjects(&self, high_water: u64) {
        let window = u64::try_from(self.config.stale_window.as_millis()).unwrap_or(u64::MAX);
        let horizon = high_water.saturating_sub(window);
        let before = self.newest.len();
        self.newest.retain(|_, newest| *newest >= horizon);

        let after = self.newest.len();
        self.sweep_at
            .store(after.saturating_mul(2).max(STALE_SWEEP_LEN), Ordering::Relaxed);
        debug!(evicted = before - after, tracked = after, "Swept stale guard");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryExchange;
    use crate::publisher::{EventPublisher, PublisherConfig};
    use crate::traits::Properties;
    use bytes::Bytes;
    use orbit_core::{ConnectionHandle, Message, PresenceTracker, RoomRegistry};
    use orbit_protocol::{Identity, PresenceState, StatusRecord, UserStatusData};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn viewer_of(registry: &RoomRegistry, subject: &str) -> UnboundedReceiver<Arc<Message>> {
        let (handle, rx) = ConnectionHandle::new(
            format!("viewer-of-{subject}"),
            Identity::new("viewer", "viewer", "viewer@example.com"),
        );
        registry.register(handle);
        registry
            .join_circle(&format!("viewer-of-{subject}"), subject)
            .unwrap();
        rx
    }

    fn status_event(uid: &str, state: PresenceState, timestamp: u64) -> PresenceEvent<UserStatusData> {
        PresenceEvent {
            from: Identity::new(uid, uid, format!("{uid}@example.com")),
            data: UserStatusData {
                is_hard_update: true,
                status: StatusRecord::new(state, timestamp),
            },
            is_hard_update: true,
            timestamp,
        }
    }

    fn delivery(routing_key: &str, origin: &str, body: serde_json::Value) -> Delivery {
        Delivery {
            routing_key: routing_key.to_string(),
            properties: Properties {
                app_id: "orbit".into(),
                timestamp: 1,
                origin: origin.into(),
            },
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    fn receiver(
        exchange: Arc<MemoryExchange>,
        registry: Arc<RoomRegistry>,
        config: ReceiverConfig,
    ) -> EventReceiver {
        EventReceiver::new(exchange, registry, "instance-b", config)
    }

    #[test]
    fn test_delivery_reaches_circle() {
        let registry = Arc::new(RoomRegistry::new());
        let mut rx = viewer_of(&registry, "u1");
        let receiver = receiver(Arc::new(MemoryExchange::new()), registry, ReceiverConfig::default());

        let body = serde_json::to_value(status_event("u1", PresenceState::AppearBusy, 10)).unwrap();
        let count = receiver
            .handle_delivery(&delivery("events.USER_STATUS", "instance-a", body.clone()))
            .unwrap();
        assert_eq!(count, 1);

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.room, "u1-circle");
        assert_eq!(msg.event, EventName::UserStatus);
        assert_eq!(*msg.payload, body);
    }

    #[test]
    fn test_malformed_deliveries_are_dropped() {
        let registry = Arc::new(RoomRegistry::new());
        let mut rx = viewer_of(&registry, "u1");
        let receiver = receiver(Arc::new(MemoryExchange::new()), registry, ReceiverConfig::default());

        let missing_from = json!({ "data": {}, "isHardUpdate": false, "timestamp": 1 });
        assert_eq!(
            receiver.handle_delivery(&delivery("events.USER_STATUS", "a", missing_from)),
            Err(Dropped::Malformed)
        );

        let mut garbage = delivery("events.USER_STATUS", "a", json!(null));
        garbage.body = Bytes::from_static(b"\xff\x00not json");
        assert_eq!(receiver.handle_delivery(&garbage), Err(Dropped::Malformed));

        let body = serde_json::to_value(status_event("u1", PresenceState::Online, 1)).unwrap();
        assert_eq!(
            receiver.handle_delivery(&delivery("events.USER_TYPING", "a", body)),
            Err(Dropped::UnknownTopic)
        );

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_skip_own_events() {
        let registry = Arc::new(RoomRegistry::new());
        let mut rx = viewer_of(&registry, "u1");
        let config = ReceiverConfig {
            skip_own_events: true,
            ..Default::default()
        };
        let receiver = receiver(Arc::new(MemoryExchange::new()), registry, config);
        let body = serde_json::to_value(status_event("u1", PresenceState::Online, 1)).unwrap();

        assert_eq!(
            receiver.handle_delivery(&delivery("events.USER_STATUS", "instance-b", body.clone())),
            Err(Dropped::OwnEvent)
        );
        assert_eq!(
            receiver.handle_delivery(&delivery("events.USER_STATUS", "instance-a", body)),
            Ok(1)
        );
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_stale_guard() {
        let registry = Arc::new(RoomRegistry::new());
        let _rx = viewer_of(&registry, "u1");
        let config = ReceiverConfig {
            reject_stale_events: true,
            ..Default::default()
        };
        let receiver = receiver(Arc::new(MemoryExchange::new()), registry, config);

        let newer = serde_json::to_value(status_event("u1", PresenceState::Offline, 20)).unwrap();
        let older = serde_json::to_value(status_event("u1", PresenceState::Online, 10)).unwrap();

        assert!(receiver
            .handle_delivery(&delivery("events.USER_STATUS", "a", newer.clone()))
            .is_ok());
        assert_eq!(
            receiver.handle_delivery(&delivery("events.USER_STATUS", "a", older)),
            Err(Dropped::Stale)
        );
        // Redelivery of the same event is still accepted
        assert!(receiver
            .handle_delivery(&delivery("events.USER_STATUS", "a", newer))
            .is_ok());
    }

    #[test]
    fn test_status_deliveries_update_presence() {
        let registry = Arc::new(RoomRegistry::new());
        let tracker = Arc::new(PresenceTracker::new());
        let receiver = receiver(Arc::new(MemoryExchange::new()), registry, ReceiverConfig::default())
            .with_presence(tracker.clone());

        let busy = serde_json::to_value(status_event("u1", PresenceState::AppearBusy, 20)).unwrap();
        let late = serde_json::to_value(status_event("u1", PresenceState::Offline, 10)).unwrap();
        receiver
            .handle_delivery(&delivery("events.USER_STATUS", "a", busy))
            .unwrap();
        // Still rebroadcast, but the older record does not replace the newer one
        receiver
            .handle_delivery(&delivery("events.USER_STATUS", "a", late))
            .unwrap();

        assert_eq!(
            tracker.get("u1").unwrap(),
            StatusRecord::new(PresenceState::AppearBusy, 20)
        );

        // Notification pings carry no status
        let ping = json!({
            "from": { "uid": "u2", "username": "u2", "email": "u2@example.com" },
            "data": { "unread": 1 },
            "isHardUpdate": false,
            "timestamp": 30
        });
        receiver
            .handle_delivery(&delivery("events.USER_NOTIFICATIONS", "a", ping))
            .unwrap();
        assert!(tracker.get("u2").is_none());
    }

    #[test]
    fn test_status_without_status_record_is_malformed() {
        let registry = Arc::new(RoomRegistry::new());
        let mut rx = viewer_of(&registry, "u1");
        let receiver = receiver(Arc::new(MemoryExchange::new()), registry, ReceiverConfig::default());

        let body = json!({
            "from": { "uid": "u1", "username": "u1", "email": "u1@example.com" },
            "data": { "unread": 1 },
            "isHardUpdate": false,
            "timestamp": 1
        });
        assert_eq!(
            receiver.handle_delivery(&delivery("events.USER_STATUS", "a", body)),
            Err(Dropped::Malformed)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stale_guard_forgets_quiet_subjects() {
        let config = ReceiverConfig {
            reject_stale_events: true,
            stale_window: Duration::from_millis(100),
            ..Default::default()
        };
        let receiver = receiver(
            Arc::new(MemoryExchange::new()),
            Arc::new(RoomRegistry::new()),
            config,
        );

        let subjects = STALE_SWEEP_LEN as u64 + 500;
        for i in 0..subjects {
            receiver.admit_newest(&format!("u{i}"), i).unwrap();
        }
        assert!(receiver.newest.len() < STALE_SWEEP_LEN);

        // Subjects inside the window are still guarded
        let recent = format!("u{}", subjects - 1);
        assert_eq!(receiver.admit_newest(&recent, 0), Err(Dropped::Stale));
    }

    #[tokio::test]
    async fn test_run_survives_malformed_messages() {
        let exchange = Arc::new(MemoryExchange::new());
        let registry = Arc::new(RoomRegistry::new());
        let mut rx = viewer_of(&registry, "u1");
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            receiver(exchange.clone(), registry, ReceiverConfig::default()).run(cancel.clone()),
        );
        while exchange.subscription_count() == 0 {
            tokio::task::yield_now().await;
        }

        exchange
            .publish(delivery("events.USER_STATUS", "a", json!({ "data": {} })))
            .await
            .unwrap();
        let publisher = EventPublisher::new(exchange.clone(), PublisherConfig::default(), "a");
        publisher
            .publish(EventName::UserStatus, &status_event("u1", PresenceState::AppearAway, 5))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload["data"]["status"]["state"], "APPEAR_AWAY");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_resubscribes_after_disconnect() {
        let exchange = Arc::new(MemoryExchange::new());
        let registry = Arc::new(RoomRegistry::new());
        let mut rx = viewer_of(&registry, "u1");
        let cancel = CancellationToken::new();
        let config = ReceiverConfig {
            reconnect_min: Duration::from_millis(1),
            reconnect_max: Duration::from_millis(5),
            ..Default::default()
        };

        let task = tokio::spawn(receiver(exchange.clone(), registry, config).run(cancel.clone()));
        while exchange.subscription_count() == 0 {
            tokio::task::yield_now().await;
        }

        // Broker outage: the subscription ends and resubscribing fails for a while
        exchange.set_available(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        exchange.set_available(true);

        while exchange.subscription_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let publisher = EventPublisher::new(exchange.clone(), PublisherConfig::default(), "a");
        publisher
            .publish(EventName::UserStatus, &status_event("u1", PresenceState::Offline, 7))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload["data"]["status"]["state"], "OFFLINE");

        cancel.cancel();
        task.await.unwrap();
    }
}
