//! Metrics collection and export for Air.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use air_core::DispatchStats;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "air_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "air_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "air_connections_rejected_total";
    pub const FRAMES_INBOUND: &str = "air_frames_inbound_total";
    pub const PUBLISH_TOTAL: &str = "air_publish_total";
    pub const DISPATCH_REQUESTS: &str = "air_dispatch_requests_total";
    pub const DISPATCH_DELIVERIES: &str = "air_dispatch_deliveries_total";
    pub const DISPATCH_FAILURES: &str = "air_dispatch_failures_total";
    pub const DISPATCH_DROPPED: &str = "air_dispatch_dropped_total";
    pub const DISPATCH_PENDING: &str = "air_dispatch_pending";
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
    metrics::describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Connections refused before upgrade"
    );
    metrics::describe_counter!(names::FRAMES_INBOUND, "Text frames received from clients");
    metrics::describe_counter!(names::PUBLISH_TOTAL, "Publish API calls by outcome");
    metrics::describe_counter!(names::DISPATCH_REQUESTS, "Requests processed by the dispatcher");
    metrics::describe_counter!(names::DISPATCH_DELIVERIES, "Frames written by the dispatcher");
    metrics::describe_counter!(names::DISPATCH_FAILURES, "Failed dispatcher writes");
    metrics::describe_counter!(
        names::DISPATCH_DROPPED,
        "Frames skipped because the recipient had disconnected"
    );
    metrics::describe_gauge!(names::DISPATCH_PENDING, "Requests waiting in the dispatch queue");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

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

/// Record a connection refused before upgrade.
pub fn record_rejection(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record an inbound text frame.
pub fn record_frame() {
    counter!(names::FRAMES_INBOUND).increment(1);
}

/// Record a publish API call.
pub fn record_publish(outcome: &'static str) {
    counter!(names::PUBLISH_TOTAL, "outcome" => outcome).increment(1);
}

/// Mirror dispatcher totals into counters and the queue depth into a gauge.
pub fn set_dispatch_stats(stats: &DispatchStats) {
    counter!(names::DISPATCH_REQUESTS).absolute(stats.requests);
    counter!(names::DISPATCH_DELIVERIES).absolute(stats.deliveries);
    counter!(names::DISPATCH_FAILURES).absolute(stats.failures);
    counter!(names::DISPATCH_DROPPED).absolute(stats.dropped);
    gauge!(names::DISPATCH_PENDING).set(stats.pending as f64);
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
