//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (requests, latency, cache, upstream process)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by method, status and cache result
//! - `proxy_request_duration_seconds` (histogram): latency distribution
//! - `proxy_cache_requests_total` (counter): cache outcomes (hit, miss, bypass)
//! - `proxy_cache_stores_total` / `proxy_cache_evictions_total` (counters)
//! - `proxy_cache_entries` / `proxy_cache_bytes` (gauges)
//! - `proxy_upstream_errors_total` (counter): failed upstream round trips
//! - `proxy_upstream_process_starts_total` / `proxy_upstream_process_exits_total`
//!
//! # Design Decisions
//! - Recording without an installed exporter is a no-op
//! - Labels stay low-cardinality (no paths)

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::cache::CacheOutcome;

pub mod names {
    pub const REQUESTS_TOTAL: &str = "proxy_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "proxy_request_duration_seconds";

    pub const CACHE_REQUESTS_TOTAL: &str = "proxy_cache_requests_total";
    pub const CACHE_STORES_TOTAL: &str = "proxy_cache_stores_total";
    pub const CACHE_EVICTIONS_TOTAL: &str = "proxy_cache_evictions_total";
    pub const CACHE_ENTRIES: &str = "proxy_cache_entries";
    pub const CACHE_BYTES: &str = "proxy_cache_bytes";

    pub const UPSTREAM_ERRORS_TOTAL: &str = "proxy_upstream_errors_total";
    pub const UPSTREAM_PROCESS_STARTS_TOTAL: &str = "proxy_upstream_process_starts_total";
    pub const UPSTREAM_PROCESS_EXITS_TOTAL: &str = "proxy_upstream_process_exits_total";
}

/// Install the Prometheus exporter with its own HTTP listener.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install Prometheus exporter"),
    }
}

/// Record a completed client request.
///
/// `cache` is the `X-Cache` value the response carried, or `none`.
pub fn record_request(method: &str, status: u16, cache: &str, duration: Duration) {
    counter!(
        names::REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string(),
        "cache" => cache.to_string()
    )
    .increment(1);

    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_cache_outcome(outcome: CacheOutcome) {
    counter!(names::CACHE_REQUESTS_TOTAL, "outcome" => outcome.as_str()).increment(1);
}

pub fn record_cache_store() {
    counter!(names::CACHE_STORES_TOTAL).increment(1);
}

pub fn record_cache_evictions(count: usize) {
    counter!(names::CACHE_EVICTIONS_TOTAL).increment(count as u64);
}

/// Record current memory cache occupancy.
pub fn record_cache_size(entries: usize, bytes: usize) {
    gauge!(names::CACHE_ENTRIES).set(entries as f64);
    gauge!(names::CACHE_BYTES).set(bytes as f64);
}

/// Record an upstream round trip that failed. `kind` is `bad_gateway` or `body_too_large`.
pub fn record_upstream_error(kind: &'static str) {
    counter!(names::UPSTREAM_ERRORS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_upstream_start() {
    counter!(names::UPSTREAM_PROCESS_STARTS_TOTAL).increment(1);
}

/// Record the supervised process exiting, `clean` when it was expected.
pub fn record_upstream_exit(clean: bool) {
    let result = if clean { "clean" } else { "failed" };
    counter!(names::UPSTREAM_PROCESS_EXITS_TOTAL, "result" => result).increment(1);
}
