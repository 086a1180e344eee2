//! Connection handlers for Orbit server.
//!
//! This module handles the connection lifecycle and message processing.

use crate::config::{BusBackend, Config};
use crate::gate::{ConnectionGate, GateOutcome};
use crate::gateway::{PresenceGateway, Session};
use crate::jwt::JwtValidator;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{bail, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use orbit_bus::{EventPublisher, EventReceiver, Exchange, MemoryExchange};
use orbit_core::{RoomRegistry, TokenValidator};
use orbit_protocol::{codec, Frame, ProtocolError};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Presence gateway.
    pub gateway: Arc<PresenceGateway>,
    /// Handshake authentication.
    pub gate: ConnectionGate,
    /// Message bus.
    pub exchange: Arc<dyn Exchange>,
    /// Id stamped on everything this instance publishes.
    pub instance_id: String,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(
        config: Config,
        exchange: Arc<dyn Exchange>,
        validator: Arc<dyn TokenValidator>,
        instance_id: String,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::with_config(config.registry()));
        let publisher = EventPublisher::new(
            Arc::clone(&exchange),
            config.publisher(),
            instance_id.clone(),
        );

        Self {
            gateway: Arc::new(PresenceGateway::new(registry, publisher)),
            gate: ConnectionGate::new(validator, config.handshake_timeout()),
            exchange,
            instance_id,
            config,
        }
    }

    /// Bus receiver rebroadcasting into this instance's rooms.
    #[must_use]
    pub fn receiver(&self) -> EventReceiver {
        EventReceiver::new(
            Arc::clone(&self.exchange),
            self.gateway.registry().clone(),
            self.instance_id.clone(),
            self.config.receiver(),
        )
        .with_presence(self.gateway.tracker().clone())
    }
}

/// Connect to the configured bus backend.
async fn connect_exchange(config: &Config) -> Result<Arc<dyn Exchange>> {
    match config.bus.backend {
        BusBackend::Memory => {
            warn!("Using the in-memory bus; events stay on this instance");
            Ok(Arc::new(MemoryExchange::new()))
        }
        BusBackend::Redis => Ok(Arc::new(
            orbit_bus::RedisExchange::connect(&config.bus.url).await?,
        )),
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/notify", post(notify_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.auth.jwt_secret.is_empty() {
        bail!("auth.jwt_secret is not set (ORBIT__AUTH__JWT_SECRET)");
    }

    let exchange = connect_exchange(&config).await?;
    let validator = Arc::new(JwtValidator::new(
        config.auth.jwt_secret.as_bytes(),
        config.auth.leeway_secs,
    ));
    let instance_id = orbit_bus::new_instance_id();
    info!(instance = %instance_id, backend = exchange.name(), "Instance starting");

    let state = Arc::new(AppState::new(config.clone(), exchange, validator, instance_id));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let cancel = CancellationToken::new();
    let receiver = tokio::spawn(state.receiver().run(cancel.clone()));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Orbit server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    if let Err(e) = receiver.await {
        warn!(error = %e, "Bus receiver task failed");
    }
    info!("Orbit server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
        }
        () = cancel.cancelled() => {}
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bus_healthy = state.exchange.is_healthy();
    Json(serde_json::json!({
        "status": if bus_healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "instance": state.instance_id,
        "bus": {
            "backend": state.exchange.name(),
            "healthy": bus_healthy,
        },
        "connections": state.gateway.registry().stats().connection_count,
    }))
}

/// Notification ping on behalf of the token's user.
///
/// The token is checked by the same gate as socket handshakes; the body is
/// passed through as the event data.
async fn notify_handler(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
    Json(data): Json<serde_json::Value>,
) -> Response {
    let token = params.get(&state.config.auth.token_param).map(String::as_str);
    let identity = match state.gate.admit(token, std::future::pending()).await {
        GateOutcome::Admitted(identity) => identity,
        GateOutcome::Rejected(reason) => {
            debug!(reason = %reason, "Notify rejected");
            metrics::record_rejection(reason.label());
            return StatusCode::UNAUTHORIZED.into_response();
        }
        GateOutcome::Abandoned => return StatusCode::UNAUTHORIZED.into_response(),
    };

    match state.gateway.notify(identity, data).await {
        Ok(reached) => Json(serde_json::json!({ "reached": reached })).into_response(),
        Err(e) => {
            warn!(error = %e, "Notify failed");
            metrics::record_error("gateway");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let token = params.get(&state.config.auth.token_param).cloned();
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, token))
}

/// Frames kept from a peer that is still being authenticated.
const MAX_EARLY_FRAMES: usize = 16;

/// Encoding a connection answers in: the format of the last frame it sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    Json,
    MessagePack,
}

type Sender = SplitSink<WebSocket, Message>;

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    // Frames sent while the token is being checked are replayed once admitted
    let mut early = Vec::new();
    let outcome = state
        .gate
        .admit(token.as_deref(), wait_for_close(&mut receiver, &mut early))
        .await;

    let identity = match outcome {
        GateOutcome::Admitted(identity) => identity,
        GateOutcome::Rejected(reason) => {
            debug!(reason = %reason, "Handshake rejected");
            metrics::record_rejection(reason.label());
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
        GateOutcome::Abandoned => {
            metrics::record_rejection("abandoned");
            return;
        }
    };

    let _metrics_guard = ConnectionMetricsGuard::new();
    let (session, mut outbound) = state.gateway.on_connect(identity);

    let mut format = WireFormat::Json;
    let mut read_buffer = BytesMut::with_capacity(4096);

    let mut open = true;
    for msg in early {
        if handle_inbound(&state, &session, msg, &mut format, &mut read_buffer, &mut sender)
            .await
            .is_break()
        {
            open = false;
            break;
        }
    }

    // Message processing loop
    while open {
        tokio::select! {
            biased;

            Some(msg) = outbound.recv() => {
                let frame = Frame::new(msg.event, (*msg.payload).clone());
                if let Err(e) = send_frame(&mut sender, &frame, format).await {
                    debug!(connection = %session.connection_id, error = %e, "Outbound send failed");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if handle_inbound(&state, &session, msg, &mut format, &mut read_buffer, &mut sender)
                            .await
                            .is_break()
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(connection = %session.connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %session.connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.gateway.on_disconnect(&session).await;
}

/// Buffer messages until the peer closes the socket.
///
/// Only the first [`MAX_EARLY_FRAMES`] are kept; the peer is not trusted yet.
async fn wait_for_close<S, E>(receiver: &mut S, early: &mut Vec<Message>)
where
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    let mut dropped = 0usize;
    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
        if early.len() < MAX_EARLY_FRAMES {
            early.push(msg);
        } else {
            dropped += 1;
        }
    }
    if dropped > 0 {
        debug!(dropped, "Dropped frames sent before authentication");
    }
}

/// Handle one inbound socket message.
async fn handle_inbound(
    state: &AppState,
    session: &Session,
    msg: Message,
    format: &mut WireFormat,
    read_buffer: &mut BytesMut,
    sender: &mut Sender,
) -> ControlFlow<()> {
    match msg {
        Message::Text(text) => {
            *format = WireFormat::Json;
            metrics::record_message(text.len(), "inbound");
            match codec::decode_text(&text) {
                Ok(frame) => handle_frame(state, session, &frame).await,
                Err(e) => {
                    warn!(connection = %session.connection_id, error = %e, "Ignoring undecodable frame");
                    metrics::record_error("decode");
                }
            }
        }
        Message::Binary(data) => {
            *format = WireFormat::MessagePack;
            metrics::record_message(data.len(), "inbound");
            read_buffer.extend_from_slice(&data);

            for frame in drain_binary_frames(read_buffer, &session.connection_id) {
                handle_frame(state, session, &frame).await;
            }
        }
        Message::Ping(data) => {
            if sender.send(Message::Pong(data)).await.is_err() {
                return ControlFlow::Break(());
            }
        }
        Message::Pong(_) => {}
        Message::Close(_) => {
            debug!(connection = %session.connection_id, "Received close frame");
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// Decode every complete binary frame in `read_buffer`.
///
/// A frame whose body does not decode has already been consumed, so the
/// frames after it are still read. An oversized length header leaves no way
/// to find the next frame and discards the buffer.
fn drain_binary_frames(read_buffer: &mut BytesMut, connection_id: &str) -> Vec<Frame> {
    let mut frames = Vec::new();
    loop {
        match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => break,
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                warn!(connection = %connection_id, error = %e, "Discarding oversized frame");
                metrics::record_error("decode");
                read_buffer.clear();
                break;
            }
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Ignoring undecodable frame");
                metrics::record_error("decode");
            }
        }
    }
    frames
}

/// Handle a decoded frame.
async fn handle_frame(state: &AppState, session: &Session, frame: &Frame) {
    let start = Instant::now();
    if let Err(e) = state.gateway.dispatch(session, frame).await {
        warn!(connection = %session.connection_id, event = %frame.event, error = %e, "Frame rejected");
        metrics::record_error("gateway");
    }
    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut Sender, frame: &Frame, format: WireFormat) -> Result<()> {
    let msg = match format {
        WireFormat::Json => Message::Text(codec::encode_text(frame)?),
        WireFormat::MessagePack => Message::Binary(codec::encode(frame)?.to_vec()),
    };
    metrics::record_message(message_len(&msg), "outbound");
    sender.send(msg).await?;
    Ok(())
}

fn message_len(msg: &Message) -> usize {
    match msg {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}
