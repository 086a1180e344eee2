//! Bus metrics.

/// Metric names.
pub mod names {
    pub const PUBLISHED_TOTAL: &str = "orbit_bus_published_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "orbit_bus_publish_failures_total";
    pub const DELIVERIES_TOTAL: &str = "orbit_bus_deliveries_total";
    pub const DROPPED_TOTAL: &str = "orbit_bus_dropped_total";
    pub const RESUBSCRIBES_TOTAL: &str = "orbit_bus_resubscribes_total";
}

/// Describe bus metrics to the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(names::PUBLISHED_TOTAL, "Presence events published to the bus");
    metrics::describe_counter!(
        names::PUBLISH_FAILURES_TOTAL,
        "Presence events the bus refused or could not take"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Bus deliveries rebroadcast to local rooms"
    );
    metrics::describe_counter!(names::DROPPED_TOTAL, "Bus deliveries dropped by the receiver");
    metrics::describe_counter!(
        names::RESUBSCRIBES_TOTAL,
        "Times the receiver had to subscribe again"
    );
}

pub(crate) fn record_published(topic: &'static str) {
    metrics::counter!(names::PUBLISHED_TOTAL, "topic" => topic).increment(1);
}

pub(crate) fn record_publish_failure(topic: &'static str) {
    metrics::counter!(names::PUBLISH_FAILURES_TOTAL, "topic" => topic).increment(1);
}

pub(crate) fn record_delivery(topic: &'static str) {
    metrics::counter!(names::DELIVERIES_TOTAL, "topic" => topic).increment(1);
}

pub(crate) fn record_dropped(reason: &'static str) {
    metrics::counter!(names::DROPPED_TOTAL, "reason" => reason).increment(1);
}

pub(crate) fn record_resubscribe() {
    metrics::counter!(names::RESUBSCRIBES_TOTAL).increment(1);
}
