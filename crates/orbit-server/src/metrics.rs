//! Metrics collection and export for Orbit.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "orbit_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "orbit_connections_active";
    pub const HANDSHAKE_REJECTIONS_TOTAL: &str = "orbit_handshake_rejections_total";
    pub const MESSAGES_TOTAL: &str = "orbit_messages_total";
    pub const MESSAGES_BYTES: &str = "orbit_messages_bytes";
    pub const TRANSITIONS_TOTAL: &str = "orbit_presence_transitions_total";
    pub const BROADCASTS_TOTAL: &str = "orbit_broadcasts_total";
    pub const ROOMS_ACTIVE: &str = "orbit_rooms_active";
    pub const LATENCY_SECONDS: &str = "orbit_frame_latency_seconds";
    pub const ERRORS_TOTAL: &str = "orbit_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of admitted connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of admitted connections"
    );
    metrics::describe_counter!(
        names::HANDSHAKE_REJECTIONS_TOTAL,
        "Connections closed by the connection gate"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of socket messages");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of socket messages");
    metrics::describe_counter!(
        names::TRANSITIONS_TOTAL,
        "Presence state changes applied by this instance"
    );
    metrics::describe_counter!(
        names::BROADCASTS_TOTAL,
        "Events fanned out to local rooms by the gateway"
    );
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of local rooms");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    orbit_bus::metrics::describe_metrics();

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an admitted connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a connection refused at handshake.
pub fn record_rejection(reason: &'static str) {
    counter!(names::HANDSHAKE_REJECTIONS_TOTAL, "reason" => reason).increment(1);
}

/// Record a socket message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a presence transition.
pub fn record_transition(trigger: &'static str) {
    counter!(names::TRANSITIONS_TOTAL, "trigger" => trigger).increment(1);
}

/// Record a local fan-out.
pub fn record_broadcast(event: &'static str) {
    counter!(names::BROADCASTS_TOTAL, "event" => event).increment(1);
}

/// Update active room count.
pub fn set_active_rooms(count: usize) {
    gauge!(names::ROOMS_ACTIVE).set(count as f64);
}

/// Record frame handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
