//! Presence gateway.
//!
//! Turns inbound socket events into room membership changes and presence
//! transitions. Every resulting event is fanned out twice: to the subject's
//! local circle room, and to the bus so peer instances can do the same.

use crate::metrics;
use orbit_bus::EventPublisher;
use orbit_core::{
    circle_room, generate_connection_id, identity_room, ConnectionHandle, ConnectionId,
    LocalBroadcast, Message, PresenceTracker, PresenceTrigger, RegistryError, RoomRegistry,
};
use orbit_protocol::{
    EventName, Frame, Identity, NotificationsData, PresenceEvent, ProtocolError, UserProfile,
    UserStatusData,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

/// Gateway errors.
///
/// None of these close the connection; the frame is dropped and logged.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The frame payload does not match its event.
    #[error("Invalid {event} payload: {source}")]
    InvalidPayload {
        /// Event the payload was sent with.
        event: EventName,
        /// Why decoding failed.
        source: ProtocolError,
    },

    /// A room operation was refused.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// An outbound event could not be serialized.
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An admitted connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Connection id within this instance.
    pub connection_id: ConnectionId,
    /// Identity attached at handshake.
    pub identity: Identity,
}

/// Per-instance presence gateway.
pub struct PresenceGateway {
    registry: Arc<RoomRegistry>,
    tracker: Arc<PresenceTracker>,
    publisher: EventPublisher,
}

impl PresenceGateway {
    /// Create a gateway over `registry`, publishing through `publisher`.
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>, publisher: EventPublisher) -> Self {
        Self {
            registry,
            tracker: Arc::new(PresenceTracker::new()),
            publisher,
        }
    }

    /// The local room table.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Status records, shared with the bus receiver so that statuses set on
    /// other instances count when judging stickiness here.
    #[must_use]
    pub fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.tracker
    }

    /// Register an admitted connection.
    ///
    /// Returns the session and the queue of events to write to the socket.
    pub fn on_connect(&self, identity: Identity) -> (Session, UnboundedReceiver<Arc<Message>>) {
        let connection_id = generate_connection_id();
        let (handle, outbound) = ConnectionHandle::new(connection_id.clone(), identity.clone());
        self.registry.register(handle);

        info!(connection = %connection_id, uid = %identity.uid, "Connection admitted");
        (
            Session {
                connection_id,
                identity,
            },
            outbound,
        )
    }

    /// Dispatch one inbound frame to its handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is invalid or a room operation fails.
    pub async fn dispatch(&self, session: &Session, frame: &Frame) -> Result<(), GatewayError> {
        debug!(connection = %session.connection_id, event = %frame.event, "Dispatching frame");

        match frame.event {
            EventName::LoggedIn => {
                let profile = inbound::<UserProfile>(frame)?;
                self.handle_logged_in(session, profile).await
            }
            EventName::LoggedOut => self.handle_logged_out(session).await,
            EventName::UserStatus => {
                let data = inbound::<UserStatusData>(frame)?;
                self.handle_user_status(session, data).await
            }
            EventName::UserNotifications => {
                let data = inbound::<NotificationsData>(frame)?;
                self.handle_user_notifications(session, &data)
            }
        }
    }

    /// `LOGGED_IN`: join the user's own rooms and run the login transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the rooms cannot be joined.
    pub async fn handle_logged_in(
        &self,
        session: &Session,
        profile: UserProfile,
    ) -> Result<(), GatewayError> {
        let uid = &session.identity.uid;
        self.registry
            .join(&session.connection_id, &identity_room(uid))?;
        self.registry.join_circle(&session.connection_id, uid)?;
        metrics::set_active_rooms(self.registry.room_count());

        if let Some(status) = profile.status {
            self.tracker.seed(uid, status);
        }

        self.apply(&session.identity, PresenceTrigger::Login).await
    }

    /// `LOGGED_OUT`: run the logout transition and leave the user's own rooms.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting event cannot be encoded.
    pub async fn handle_logged_out(&self, session: &Session) -> Result<(), GatewayError> {
        let result = self.apply(&session.identity, PresenceTrigger::Logout).await;

        let uid = &session.identity.uid;
        self.registry
            .leave(&session.connection_id, &identity_room(uid));
        self.registry.leave_circle(&session.connection_id, uid);
        metrics::set_active_rooms(self.registry.room_count());

        result
    }

    /// `USER_STATUS`: a status set by the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting event cannot be encoded.
    pub async fn handle_user_status(
        &self,
        session: &Session,
        data: UserStatusData,
    ) -> Result<(), GatewayError> {
        let trigger = if data.is_hard_update {
            PresenceTrigger::explicit(data.status.state)
        } else {
            PresenceTrigger::soft(data.status.state)
        };
        self.apply(&session.identity, trigger).await
    }

    /// `USER_NOTIFICATIONS`: start or stop following a subject's circle.
    ///
    /// # Errors
    ///
    /// Returns an error if the circle cannot be joined.
    pub fn handle_user_notifications(
        &self,
        session: &Session,
        data: &NotificationsData,
    ) -> Result<(), GatewayError> {
        if data.should_receive {
            self.registry
                .join_circle(&session.connection_id, &data.subscribed_user_uid)?;
        } else {
            self.registry
                .leave_circle(&session.connection_id, &data.subscribed_user_uid);
        }
        metrics::set_active_rooms(self.registry.room_count());

        debug!(
            connection = %session.connection_id,
            subject = %data.subscribed_user_uid,
            follow = data.should_receive,
            "Circle membership changed"
        );
        Ok(())
    }

    /// The transport closed: unregister and run the logout transition.
    pub async fn on_disconnect(&self, session: &Session) {
        self.registry.remove_connection(&session.connection_id);
        metrics::set_active_rooms(self.registry.room_count());

        if let Err(e) = self.apply(&session.identity, PresenceTrigger::Logout).await {
            debug!(connection = %session.connection_id, error = %e, "Disconnect fan-out failed");
        }
        info!(connection = %session.connection_id, uid = %session.identity.uid, "Connection closed");
    }

    /// Ping the circle of `from` with a `USER_NOTIFICATIONS` event.
    ///
    /// Used by collaborators that learn about new notifications outside the
    /// socket protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be encoded.
    pub async fn notify<T: Serialize + Send + Sync>(
        &self,
        from: Identity,
        data: T,
    ) -> Result<usize, GatewayError> {
        let event = PresenceEvent::new(from, data, false);
        self.fan_out(EventName::UserNotifications, &event).await
    }

    async fn apply(&self, identity: &Identity, trigger: PresenceTrigger) -> Result<(), GatewayError> {
        let Some(transition) = self.tracker.apply(&identity.uid, trigger) else {
            debug!(uid = %identity.uid, trigger = trigger.label(), "Sticky state kept");
            return Ok(());
        };
        metrics::record_transition(trigger.label());

        let event = PresenceEvent::new(
            identity.clone(),
            UserStatusData {
                is_hard_update: transition.is_hard_update,
                status: transition.record,
            },
            transition.is_hard_update,
        );
        self.fan_out(EventName::UserStatus, &event).await?;
        Ok(())
    }

    /// Broadcast to the local circle, then publish for the other instances.
    ///
    /// A failed publish is not an error here: presence is soft state and the
    /// next event for the subject corrects it.
    async fn fan_out<T: Serialize + Sync>(
        &self,
        topic: EventName,
        event: &PresenceEvent<T>,
    ) -> Result<usize, GatewayError> {
        let payload = Arc::new(serde_json::to_value(event)?);
        let room = circle_room(&event.from.uid);
        let count = self.registry.broadcast(&room, topic, payload);
        metrics::record_broadcast(topic.as_str());

        if let Err(e) = self.publisher.publish(topic, event).await {
            debug!(room = %room, error = %e, "Continuing without bus fan-out");
        }

        debug!(room = %room, event = %topic, recipients = count, "Fanned out");
        Ok(count)
    }
}

fn inbound<T: serde::de::DeserializeOwned>(frame: &Frame) -> Result<T, GatewayError> {
    frame
        .inbound_data()
        .map_err(|source| GatewayError::InvalidPayload {
            event: frame.event,
            source,
        })
}
