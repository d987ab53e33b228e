//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when the shared store is unreachable.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Browser sockets on this instance.
    pub connections: usize,
    /// Sessions whose bridge runs on this instance.
    pub active_sessions: usize,
    pub instance_id: String,
    /// `"ok"` or `"unavailable"`.
    pub store: &'static str,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    active_sessions: usize,
    instance_id: &str,
    store_ok: bool,
) -> HealthResponse {
    HealthResponse {
        status: if store_ok { "ok" } else { "degraded" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions,
        instance_id: instance_id.to_owned(),
        store: if store_ok { "ok" } else { "unavailable" },
    }
}
