//! Periodic cleanup of lapsed sessions, index entries and leases.

use std::time::Duration;

use jobline_telemetry::metrics::SWEEPER_REMOVED_TOTAL;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::errors::Result;
use crate::lease::OwnershipLease;
use crate::session_store::SessionStore;

/// What one sweep removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub orphaned_index_entries: usize,
    pub expired_records: usize,
    pub expired_leases: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone, Debug)]
pub struct Sweeper {
    store: SessionStore,
    lease: OwnershipLease,
    interval: Duration,
}

impl Sweeper {
    pub fn new(store: SessionStore, lease: OwnershipLease, interval: Duration) -> Self {
        Self {
            store,
            lease,
            interval,
        }
    }

    /// One pass. Lapsed rows are deleted before the index is pruned so the
    /// same pass removes both.
    #[instrument(skip(self), name = "sweep")]
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let expired_records = self.store.purge_expired().await?;
        let orphaned_index_entries = self.store.prune_index().await?;
        let expired_leases = self.lease.purge_expired().await?;
        let report = SweepReport {
            orphaned_index_entries,
            expired_records,
            expired_leases,
        };
        record(&report);
        Ok(report)
    }

    /// Sweep every interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let _ = ticker.tick().await;
        tracing::info!(interval_secs = self.interval.as_secs(), "sweeper started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.sweep_once().await {
                Ok(report) if report.is_empty() => tracing::debug!("sweep: nothing to remove"),
                Ok(report) => tracing::info!(
                    orphaned_index_entries = report.orphaned_index_entries,
                    expired_records = report.expired_records,
                    expired_leases = report.expired_leases,
                    "sweep removed entries"
                ),
                Err(e) => tracing::warn!(error = %e, "sweep failed"),
            }
        }
        tracing::info!("sweeper stopped");
    }
}

fn record(report: &SweepReport) {
    for (kind, n) in [
        ("index_entry", report.orphaned_index_entries),
        ("record", report.expired_records),
        ("lease", report.expired_leases),
    ] {
        if n > 0 {
            metrics::counter!(SWEEPER_REMOVED_TOTAL, "kind" => kind).increment(n as u64);
        }
    }
}
