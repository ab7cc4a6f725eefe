//! Metrics collection and export for Rapport.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "rapport_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "rapport_connections_active";
    pub const FRAMES_TOTAL: &str = "rapport_frames_total";
    pub const FRAMES_BYTES: &str = "rapport_frames_bytes";
    pub const MATCHES_CREATED_TOTAL: &str = "rapport_matches_created_total";
    pub const MESSAGES_APPENDED_TOTAL: &str = "rapport_messages_appended_total";
    pub const DELIVERIES_DROPPED_TOTAL: &str = "rapport_deliveries_dropped_total";
    pub const SCOPES_ACTIVE: &str = "rapport_scopes_active";
    pub const LATENCY_SECONDS: &str = "rapport_latency_seconds";
    pub const ERRORS_TOTAL: &str = "rapport_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(names::MATCHES_CREATED_TOTAL, "Matches created");
    metrics::describe_counter!(names::MESSAGES_APPENDED_TOTAL, "Messages appended");
    metrics::describe_counter!(
        names::DELIVERIES_DROPPED_TOTAL,
        "Events dropped for subscribers that fell behind"
    );
    metrics::describe_gauge!(names::SCOPES_ACTIVE, "Current number of scopes with subscribers");
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Request frame handling latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a frame.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_match_created() {
    counter!(names::MATCHES_CREATED_TOTAL).increment(1);
}

pub fn record_message_appended() {
    counter!(names::MESSAGES_APPENDED_TOTAL).increment(1);
}

/// Record events a lagging subscriber never saw.
pub fn record_dropped(missed: u64) {
    counter!(names::DELIVERIES_DROPPED_TOTAL).increment(missed);
}

/// Record request handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Update active scope count.
pub fn set_active_scopes(count: usize) {
    gauge!(names::SCOPES_ACTIVE).set(count as f64);
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

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
