//! Prometheus metrics collection and HTTP request instrumentation.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};

/// Initialize the Prometheus metrics recorder and return the handle for rendering.
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    builder
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Axum middleware that records HTTP request metrics.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().clone().to_string();
    let path = request.uri().path().to_string();
    // Normalize path to avoid high-cardinality labels (strip UUIDs and IDs)
    let normalized = normalize_path(&path);

    let start = Instant::now();
    counter!("cf_http_requests_total", "method" => method.clone(), "path" => normalized.clone())
        .increment(1);

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    histogram!("cf_http_request_duration_seconds", "method" => method.clone(), "path" => normalized.clone(), "status" => status.clone()).record(duration);
    counter!("cf_http_responses_total", "method" => method, "path" => normalized, "status" => status).increment(1);

    response
}

/// Normalize URL paths to reduce label cardinality.
/// Replaces UUIDs and numeric IDs with placeholders.
fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let normalized: Vec<String> = segments
        .iter()
        .map(|seg| {
            if seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4 {
                // UUID pattern
                ":id".to_string()
            } else if seg.parse::<i64>().is_ok() && !seg.is_empty() {
                // Numeric ID
                ":id".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect();
    normalized.join("/")
}

/// Record the outcome of a lease acquisition attempt.
pub fn record_assignment(outcome: &str) {
    counter!("cf_lease_assignments_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a single-candidate acquisition conflict (a normal outcome).
pub fn record_assignment_conflict() {
    counter!("cf_lease_conflicts_total").increment(1);
}

/// Record leases terminated by the reclaim loop.
pub fn record_leases_reclaimed(count: u64) {
    counter!("cf_leases_reclaimed_total").increment(count);
}

/// Record commands expired by the sweep loop.
pub fn record_commands_expired(count: u64) {
    counter!("cf_commands_expired_total").increment(count);
}

/// Record stale workers evicted by the registry sweep.
pub fn record_workers_evicted(count: u64) {
    counter!("cf_workers_evicted_total").increment(count);
}

/// Record intents dropped by the protocol-level timeout sweep.
pub fn record_intents_expired(count: u64) {
    counter!("cf_intents_expired_total").increment(count);
}

/// Update the connected-worker gauge.
pub fn set_connected_workers(count: usize) {
    gauge!("cf_workers_connected").set(count as f64);
}
