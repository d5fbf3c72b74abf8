//! Lightweight metrics helpers for switchyard.
//!
//! Thin wrappers around the `metrics` crate macros. No exporter is embedded;
//! the embedding application installs any compatible recorder, and without
//! one every call is a no-op.
//!
//! Provided metrics:
//! * `switchyard_requests_total` (counter; entry_point, router, method, status)
//! * `switchyard_request_duration_seconds` (histogram; entry_point, router)
//! * `switchyard_target_health_status` (gauge per service target, 1 healthy / 0 unhealthy)
//! * `switchyard_router_builds_total` (counter; protocol, result)
//! * `switchyard_active_connections` (gauge per entry point)
//! * `switchyard_udp_sessions` (gauge per entry point)
use std::time::Duration;

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const SWITCHYARD_REQUESTS_TOTAL: &str = "switchyard_requests_total";
pub const SWITCHYARD_REQUEST_DURATION_SECONDS: &str = "switchyard_request_duration_seconds";
pub const SWITCHYARD_TARGET_HEALTH_STATUS: &str = "switchyard_target_health_status";
pub const SWITCHYARD_ROUTER_BUILDS_TOTAL: &str = "switchyard_router_builds_total";
pub const SWITCHYARD_ACTIVE_CONNECTIONS: &str = "switchyard_active_connections";
pub const SWITCHYARD_UDP_SESSIONS: &str = "switchyard_udp_sessions";

/// Router label used for requests no router matched.
pub const UNMATCHED: &str = "<none>";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests handled, by entry point and router."
    );
    describe_histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests handled, by entry point and router."
    );
    describe_gauge!(
        SWITCHYARD_TARGET_HEALTH_STATUS,
        "Health status of service targets (1 for healthy, 0 for unhealthy)."
    );
    describe_counter!(
        SWITCHYARD_ROUTER_BUILDS_TOTAL,
        Unit::Count,
        "Router builds per configuration snapshot, by protocol and result."
    );
    describe_gauge!(
        SWITCHYARD_ACTIVE_CONNECTIONS,
        "Number of currently open TCP connections per entry point."
    );
    describe_gauge!(
        SWITCHYARD_UDP_SESSIONS,
        "Number of live UDP sessions per entry point."
    );
});

/// Registers metric descriptions with the installed recorder.
pub fn describe() {
    Lazy::force(&DESCRIBED);
}

pub fn record_request(
    entry_point: &str,
    router: Option<&str>,
    method: &str,
    status: u16,
    duration: Duration,
) {
    let router = router.unwrap_or(UNMATCHED).to_string();
    counter!(
        SWITCHYARD_REQUESTS_TOTAL,
        "entry_point" => entry_point.to_string(),
        "router" => router.clone(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        SWITCHYARD_REQUEST_DURATION_SECONDS,
        "entry_point" => entry_point.to_string(),
        "router" => router
    )
    .record(duration.as_secs_f64());
}

pub fn set_target_health(service: &str, target: &str, healthy: bool) {
    gauge!(
        SWITCHYARD_TARGET_HEALTH_STATUS,
        "service" => service.to_string(),
        "target" => target.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

pub fn increment_router_builds(protocol: &'static str, ok: bool) {
    counter!(
        SWITCHYARD_ROUTER_BUILDS_TOTAL,
        "protocol" => protocol,
        "result" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

pub fn set_udp_sessions(entry_point: &str, count: usize) {
    gauge!(SWITCHYARD_UDP_SESSIONS, "entry_point" => entry_point.to_string()).set(count as f64);
}

/// RAII helper counting an open connection on an entry point.
pub struct ConnectionGuard {
    entry_point: String,
}

impl ConnectionGuard {
    pub fn new(entry_point: &str) -> Self {
        gauge!(SWITCHYARD_ACTIVE_CONNECTIONS, "entry_point" => entry_point.to_string())
            .increment(1.0);
        Self {
            entry_point: entry_point.to_string(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        gauge!(SWITCHYARD_ACTIVE_CONNECTIONS, "entry_point" => self.entry_point.clone())
            .decrement(1.0);
    }
}
