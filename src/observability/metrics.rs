//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_sessions_total` (counter): accepted client connections
//! - `proxy_active_sessions` (gauge): sessions currently running
//! - `proxy_transactions_total` (counter): finished transactions by outcome
//! - `proxy_upstream_dials_total` (counter): upstream TCP connections opened
//! - `proxy_tunnel_bytes_total` (counter): CONNECT bytes by direction
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - The Prometheus exporter is opt-in via configuration

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_session_started() {
    counter!("proxy_sessions_total").increment(1);
    gauge!("proxy_active_sessions").increment(1.0);
}

pub fn record_session_finished() {
    gauge!("proxy_active_sessions").decrement(1.0);
}

/// `outcome` is one of `completed`, `error` or `cancelled`.
pub fn record_transaction(outcome: &'static str) {
    counter!("proxy_transactions_total", "outcome" => outcome).increment(1);
}

pub fn record_upstream_dial() {
    counter!("proxy_upstream_dials_total").increment(1);
}

/// `direction` is `upstream` (client to server) or `downstream`.
pub fn record_tunnel_bytes(direction: &'static str, bytes: u64) {
    counter!("proxy_tunnel_bytes_total", "direction" => direction).increment(bytes);
}
