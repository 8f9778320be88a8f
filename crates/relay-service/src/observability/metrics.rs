//! Metrics definitions for the signaling relay.
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded. Event routing is an
/// in-memory hop, so latency buckets are weighted toward the low end.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("relay_event".to_string()),
            &[
                0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set event latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Connection & Call Metrics (Gauges)
// ============================================================================

/// Set the number of open WebSocket connections.
///
/// Metric: `relay_connections_active`
pub fn set_connections_active(count: u64) {
    // u64 to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_connections_active").set(count as f64);
}

/// Set the number of live calls.
///
/// Metric: `relay_calls_active`
pub fn set_calls_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_calls_active").set(count as f64);
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `relay_actor_mailbox_depth`
/// Labels: `actor_type` (controller, call, connection)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    // usize to f64 conversion is safe for realistic mailbox depths
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

/// Record an actor panic.
///
/// Metric: `relay_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &str) {
    counter!("relay_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record an outbound event dropped because a socket fell behind.
///
/// Metric: `relay_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &str) {
    counter!("relay_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Routing Metrics
// ============================================================================

/// Record one client event handled by the relay.
///
/// Metric: `relay_events_routed_total`
/// Labels: `event` (wire name), `outcome` (`ok` or error kind)
pub fn record_event_routed(event: &'static str, outcome: &'static str) {
    counter!("relay_events_routed_total", "event" => event, "outcome" => outcome).increment(1);
}

/// Record client event routing latency.
///
/// Metric: `relay_event_latency_seconds`
/// Labels: `event`
pub fn record_event_latency(event: &'static str, duration: Duration) {
    histogram!("relay_event_latency_seconds", "event" => event).record(duration.as_secs_f64());
}
