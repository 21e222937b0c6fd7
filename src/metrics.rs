//! Metrics emitted through the `metrics` facade.
//!
//! Nothing here installs a recorder; without one every call is a no-op.

use std::time::Duration;

/// Gateway requests by route and outcome
pub const GATEWAY_REQUESTS_TOTAL: &str = "negotiation_gateway_requests_total";
/// Gateway latency by route
pub const GATEWAY_REQUEST_DURATION: &str = "negotiation_gateway_request_duration_seconds";
/// Artifact cache lookups by result
pub const CACHE_LOOKUPS_TOTAL: &str = "negotiation_artifact_cache_lookups_total";
/// Partial failures by kind
pub const PARTIAL_FAILURES_TOTAL: &str = "negotiation_partial_failures_total";

/// Record one gateway round trip.
pub fn record_gateway_call(route: &'static str, outcome: &'static str, duration: Duration) {
    metrics::counter!(GATEWAY_REQUESTS_TOTAL, "endpoint" => route, "outcome" => outcome).increment(1);
    metrics::histogram!(GATEWAY_REQUEST_DURATION, "endpoint" => route).record(duration.as_secs_f64());
}

/// Record an artifact cache hit or miss.
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!(CACHE_LOOKUPS_TOTAL, "result" => result).increment(1);
}

/// Record a partial failure such as a proposal sent without its contract.
pub fn record_partial_failure(kind: &'static str) {
    metrics::counter!(PARTIAL_FAILURES_TOTAL, "kind" => kind).increment(1);
}
