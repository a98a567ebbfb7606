//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define node metrics (connections, messages, membership)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `cluster_connections_accepted_total` (counter)
//! - `cluster_active_connections` (gauge): admitted connections
//! - `cluster_accept_errors_total` (counter)
//! - `cluster_async_timeouts_total` (counter): parked connections timed out
//! - `cluster_messages_sent_total` (counter): by reliability, outcome
//! - `cluster_messages_received_total` (counter): by reliability
//! - `cluster_member_events_total` (counter): by event
//! - `cluster_members` (gauge)
//! - `cluster_decode_errors_total` (counter): by source
//! - `cluster_interceptor_bytes_total` (counter): by direction
//!
//! # Design Decisions
//! - Recording is a no-op until an exporter is installed
//! - Low-overhead metric updates (atomic operations)

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_accepted() {
    counter!("cluster_connections_accepted_total").increment(1);
}

pub fn set_active_connections(count: usize) {
    gauge!("cluster_active_connections").set(count as f64);
}

pub fn record_accept_error(transient: bool) {
    let kind = if transient { "transient" } else { "fatal" };
    counter!("cluster_accept_errors_total", "kind" => kind).increment(1);
}

pub fn record_async_timeout() {
    counter!("cluster_async_timeouts_total").increment(1);
}

pub fn record_message_sent(reliability: &'static str, outcome: &'static str) {
    counter!("cluster_messages_sent_total", "reliability" => reliability, "outcome" => outcome)
        .increment(1);
}

pub fn record_message_received(reliability: &'static str) {
    counter!("cluster_messages_received_total", "reliability" => reliability).increment(1);
}

pub fn record_member_event(event: &'static str) {
    counter!("cluster_member_events_total", "event" => event).increment(1);
}

pub fn set_member_count(count: usize) {
    gauge!("cluster_members").set(count as f64);
}

pub fn record_decode_error(source: &'static str) {
    counter!("cluster_decode_errors_total", "source" => source).increment(1);
}

pub fn record_interceptor_bytes(direction: &'static str, bytes: usize) {
    counter!("cluster_interceptor_bytes_total", "direction" => direction).increment(bytes as u64);
}
