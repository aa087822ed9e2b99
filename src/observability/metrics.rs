//! Metrics collection and exposition.
//!
//! # Metrics
//! - `router_requests_total` (counter): dispatched requests by protocol, route, status
//! - `router_request_duration_seconds` (histogram): dispatch latency
//! - `middleware_condition_cache_total` (counter): condition cache hits and misses
//! - `rpc_streams_active` (gauge): registered non-unary streams
//! - `rpc_streams_rejected_total` (counter): streams refused by the concurrency gate
//! - `rpc_stream_timeouts_total` (counter): streams ended by their deadline
//! - `rpc_batch_flushes_total` (counter) and `rpc_batch_size` (histogram)
//!
//! Recording is a no-op until a recorder is installed, so library users and
//! tests pay nothing when metrics are disabled.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter and serve it on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(error) => tracing::error!(%error, address = %addr, "Failed to install metrics exporter"),
    }
}

pub fn record_request(protocol: &str, route: &str, status: u16, start: Instant) {
    metrics::counter!(
        "router_requests_total",
        "protocol" => protocol.to_string(),
        "route" => route.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "router_request_duration_seconds",
        "protocol" => protocol.to_string(),
        "route" => route.to_string()
    )
    .record(start.elapsed().as_secs_f64());
}

pub fn record_condition_cache(cache: &'static str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("middleware_condition_cache_total", "cache" => cache, "result" => result)
        .increment(1);
}

pub fn record_active_streams(active: usize) {
    metrics::gauge!("rpc_streams_active").set(active as f64);
}

pub fn record_stream_rejected() {
    metrics::counter!("rpc_streams_rejected_total").increment(1);
}

pub fn record_stream_timeout(kind: &'static str) {
    metrics::counter!("rpc_stream_timeouts_total", "kind" => kind).increment(1);
}

pub fn record_batch_flush(service: &str, size: usize) {
    metrics::counter!("rpc_batch_flushes_total", "service" => service.to_string()).increment(1);
    metrics::histogram!("rpc_batch_size").record(size as f64);
}
