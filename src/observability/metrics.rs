//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (connections, handshakes, bytes, messages)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `proxy_connections_total` (counter): connections by outcome
//! - `proxy_active_connections` (gauge): current connection count
//! - `proxy_handshake_failures_total` (counter): by leg (client, target)
//! - `proxy_relayed_bytes_total` (counter): by direction
//! - `proxy_messages_total` (counter): requests/responses by outcome
//! - `proxy_observer_panics_total` (counter): by hook name
//! - `proxy_accept_errors_total` (counter): transient vs fatal
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until a
//!   recorder is installed
//! - Label values are static strings

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

/// How an accepted connection was handled.
pub fn record_connection(outcome: &'static str) {
    counter!("proxy_connections_total", "outcome" => outcome).increment(1);
}

pub fn set_active_connections(count: usize) {
    gauge!("proxy_active_connections").set(count as f64);
}

pub fn record_handshake_failure(leg: &'static str) {
    counter!("proxy_handshake_failures_total", "leg" => leg).increment(1);
}

pub fn record_relayed_bytes(direction: &'static str, bytes: usize) {
    counter!("proxy_relayed_bytes_total", "direction" => direction).increment(bytes as u64);
}

pub fn record_message(kind: &'static str, outcome: &'static str) {
    counter!("proxy_messages_total", "kind" => kind, "outcome" => outcome).increment(1);
}

pub fn record_observer_panic(hook: &'static str) {
    counter!("proxy_observer_panics_total", "hook" => hook).increment(1);
}

pub fn record_accept_error(kind: &'static str) {
    counter!("proxy_accept_errors_total", "kind" => kind).increment(1);
}
