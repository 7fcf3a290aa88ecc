//! Metrics collection and export for the Tether client.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format. Without an installed exporter every
//! recording call is a no-op.

use anyhow::Result;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const EVENTS_RECEIVED_TOTAL: &str = "tether_events_received_total";
    pub const EMITS_TOTAL: &str = "tether_emits_total";
    pub const ACKS_TOTAL: &str = "tether_acks_total";
    pub const DISCONNECTS_TOTAL: &str = "tether_disconnects_total";
    pub const ERRORS_TOTAL: &str = "tether_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::EVENTS_RECEIVED_TOTAL,
        "Total number of event payloads received"
    );
    metrics::describe_counter!(names::EMITS_TOTAL, "Total number of events emitted");
    metrics::describe_counter!(names::ACKS_TOTAL, "Total number of acknowledgments received");
    metrics::describe_counter!(names::DISCONNECTS_TOTAL, "Total number of session terminations");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics endpoint.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a received payload.
pub fn record_event(event: &str) {
    counter!(names::EVENTS_RECEIVED_TOTAL, "event" => event.to_string()).increment(1);
}

/// Record an emitted event.
pub fn record_emit(event: &str, ack: bool) {
    counter!(
        names::EMITS_TOTAL,
        "event" => event.to_string(),
        "ack" => ack.to_string()
    )
    .increment(1);
}

/// Record an acknowledgment.
pub fn record_ack(event: &str) {
    counter!(names::ACKS_TOTAL, "event" => event.to_string()).increment(1);
}

/// Record a session termination.
pub fn record_disconnect() {
    counter!(names::DISCONNECTS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}
