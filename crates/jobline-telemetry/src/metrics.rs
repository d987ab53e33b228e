//! Prometheus metrics recorder and metric name constants.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::TelemetryError;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
pub fn install_recorder() -> Result<PrometheusHandle, TelemetryError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Malformed inbound frames dropped (counter).
pub const WS_MALFORMED_MESSAGES_TOTAL: &str = "ws_malformed_messages_total";
/// Snapshot deliveries dropped on full socket queues (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "broadcast_drops_total";
/// Snapshots published (counter, labels: source).
pub const BROADCAST_SNAPSHOTS_TOTAL: &str = "broadcast_snapshots_total";
/// Lease acquisition attempts (counter, labels: outcome).
pub const LEASE_ACQUIRE_TOTAL: &str = "lease_acquire_total";
/// Leases lost while held (counter).
pub const LEASE_LOST_TOTAL: &str = "lease_lost_total";
/// Compare-and-set conflicts retried (counter).
pub const STORE_CAS_CONFLICTS_TOTAL: &str = "store_cas_conflicts_total";
/// Store calls failed as unavailable (counter).
pub const STORE_UNAVAILABLE_TOTAL: &str = "store_unavailable_total";
/// Live upstream bridges on this instance (gauge).
pub const UPSTREAM_BRIDGES_ACTIVE: &str = "upstream_bridges_active";
/// Upstream reconnect attempts (counter).
pub const UPSTREAM_RECONNECTS_TOTAL: &str = "upstream_reconnects_total";
/// Tool calls executed (counter, labels: tool).
pub const TOOL_CALLS_TOTAL: &str = "tool_calls_total";
/// Tool call duration seconds (histogram, labels: tool).
pub const TOOL_CALL_DURATION_SECONDS: &str = "tool_call_duration_seconds";
/// Entries removed by the sweeper (counter, labels: kind).
pub const SWEEPER_REMOVED_TOTAL: &str = "sweeper_removed_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_render() {
        // Build a recorder + handle without a global install.
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = handle.render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_MALFORMED_MESSAGES_TOTAL,
            BROADCAST_DROPS_TOTAL,
            BROADCAST_SNAPSHOTS_TOTAL,
            LEASE_ACQUIRE_TOTAL,
            LEASE_LOST_TOTAL,
            STORE_CAS_CONFLICTS_TOTAL,
            STORE_UNAVAILABLE_TOTAL,
            UPSTREAM_BRIDGES_ACTIVE,
            UPSTREAM_RECONNECTS_TOTAL,
            TOOL_CALLS_TOTAL,
            TOOL_CALL_DURATION_SECONDS,
            SWEEPER_REMOVED_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name {name} is not snake_case"
            );
        }
    }
}
