//! Ownership lease: which instance may run a session's upstream bridge.
//!
//! Acquisition is a single atomic set-if-absent-or-expired against the store.
//! Holders renew on a fixed interval shorter than the TTL; a crashed holder
//! simply stops renewing and the lease lapses.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobline_core::{InstanceId, SessionId};
use jobline_telemetry::metrics::{LEASE_ACQUIRE_TOTAL, LEASE_LOST_TOTAL};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, LeaseBackend};
use crate::errors::{bounded, Result, StoreError};

/// A live lease.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    pub session_id: SessionId,
    pub holder: InstanceId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OwnershipLease {
    leases: Arc<dyn LeaseBackend>,
    ttl: Duration,
    renew_interval: Duration,
    op_timeout: Duration,
}

impl std::fmt::Debug for OwnershipLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipLease")
            .field("ttl", &self.ttl)
            .field("renew_interval", &self.renew_interval)
            .finish_non_exhaustive()
    }
}

impl OwnershipLease {
    /// Leases on `backend`; every store call is bounded by `op_timeout`.
    pub fn new(backend: &Backend, ttl: Duration, renew_interval: Duration, op_timeout: Duration) -> Self {
        Self {
            leases: backend.leases.clone(),
            ttl,
            renew_interval,
            op_timeout,
        }
    }

    /// How long a lease lives without renewal.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// How often a holder renews.
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    /// How long before the store-side expiry a holder gives up ownership.
    ///
    /// At most one store call, and at most half the slack between the
    /// renewal interval and the TTL so healthy renewals always land first.
    pub fn safety_margin(&self) -> Duration {
        let slack = self.ttl.saturating_sub(self.renew_interval) / 2;
        self.op_timeout.min(slack)
    }

    /// Claim the lease if nobody holds a live one.
    pub async fn try_acquire(&self, session: &SessionId, instance: &InstanceId) -> Result<bool> {
        let acquired = bounded(
            self.op_timeout,
            "lease_acquire",
            self.leases.try_acquire(session, instance, self.ttl),
        )
        .await?;
        let outcome = if acquired { "won" } else { "held" };
        metrics::counter!(LEASE_ACQUIRE_TOTAL, "outcome" => outcome).increment(1);
        if acquired {
            tracing::info!(session_id = %session, instance_id = %instance, "lease acquired");
        }
        Ok(acquired)
    }

    /// Extend a lease `instance` still holds. `false` means it no longer does.
    pub async fn renew(&self, session: &SessionId, instance: &InstanceId) -> Result<bool> {
        bounded(
            self.op_timeout,
            "lease_renew",
            self.leases.renew(session, instance, self.ttl),
        )
        .await
    }

    /// Give the lease up if `instance` holds it.
    pub async fn release(&self, session: &SessionId, instance: &InstanceId) -> Result<bool> {
        let released = bounded(
            self.op_timeout,
            "lease_release",
            self.leases.release(session, instance),
        )
        .await?;
        if released {
            tracing::info!(session_id = %session, instance_id = %instance, "lease released");
        }
        Ok(released)
    }

    /// The live lease on `session`, if any.
    pub async fn holder(&self, session: &SessionId) -> Result<Option<LeaseRecord>> {
        let current = bounded(self.op_timeout, "lease_current", self.leases.current(session)).await?;
        Ok(current.map(|l| LeaseRecord {
            session_id: session.clone(),
            holder: l.holder,
            expires_at: l.expires_at,
        }))
    }

    /// Remove lapsed lease entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        bounded(self.op_timeout, "purge_leases", self.leases.purge_expired()).await
    }
}

/// How a renewal loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// Cancelled by the owner.
    Stopped,
    /// Ownership is gone; the bridge must stop.
    Lost,
}

/// Renew `session`'s lease every renewal interval until cancelled or lost.
///
/// The store counts a lease's TTL from when the holder's renew reached it,
/// so validity here is measured from when the last successful renew was
/// started, less a safety margin. That deadline is watched on its own: it
/// fires even while a renew call is still pending, and no later than the
/// moment another instance could acquire the lease.
///
/// A renew that reports another holder (or no lease) is loss. A renew that
/// fails because the store is unreachable is retried at the next tick.
pub async fn run_renewal(
    lease: OwnershipLease,
    session: SessionId,
    instance: InstanceId,
    cancel: CancellationToken,
) -> RenewalOutcome {
    let margin = lease.safety_margin();
    // The lease was acquired just before this loop started.
    let mut valid_until = Instant::now() + lease.ttl - margin;
    let mut ticker = tokio::time::interval(lease.renew_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return RenewalOutcome::Stopped,
            () = tokio::time::sleep_until(valid_until) => return lapsed(&session, &instance, None),
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let renewed = tokio::select! {
            biased;
            () = cancel.cancelled() => return RenewalOutcome::Stopped,
            () = tokio::time::sleep_until(valid_until) => return lapsed(&session, &instance, None),
            renewed = lease.renew(&session, &instance) => renewed,
        };
        match renewed {
            Ok(true) => valid_until = started + lease.ttl - margin,
            Ok(false) => {
                metrics::counter!(LEASE_LOST_TOTAL, "reason" => "taken").increment(1);
                tracing::warn!(session_id = %session, instance_id = %instance, "lease lost");
                return RenewalOutcome::Lost;
            }
            Err(e) if Instant::now() >= valid_until => return lapsed(&session, &instance, Some(&e)),
            Err(e) => {
                tracing::warn!(session_id = %session, error = %e, "lease renew failed, retrying");
            }
        }
    }
}

fn lapsed(session: &SessionId, instance: &InstanceId, error: Option<&StoreError>) -> RenewalOutcome {
    metrics::counter!(LEASE_LOST_TOTAL, "reason" => "unrenewed").increment(1);
    tracing::warn!(
        session_id = %session,
        instance_id = %instance,
        error = error.map(tracing::field::display),
        "lease validity ran out without a successful renew"
    );
    RenewalOutcome::Lost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    const TTL: Duration = Duration::from_secs(15);
    const RENEW: Duration = Duration::from_secs(5);

    fn lease_on(memory: &Arc<MemoryBackend>) -> OwnershipLease {
        OwnershipLease::new(
            &Backend::from_memory(memory.clone()),
            TTL,
            RENEW,
            Duration::from_secs(2),
        )
    }

    fn sid() -> SessionId {
        SessionId::from_raw("sess_lease")
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_holder_is_taken_over_after_ttl() {
        let memory = Arc::new(MemoryBackend::new());
        let lease = lease_on(&memory);
        let (a, b) = (InstanceId::from_raw("inst_a"), InstanceId::from_raw("inst_b"));

        assert!(lease.try_acquire(&sid(), &a).await.unwrap());
        // `a` crashes: no renew, no release.
        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert!(!lease.try_acquire(&sid(), &b).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(lease.try_acquire(&sid(), &b).await.unwrap());
        assert_eq!(lease.holder(&sid()).await.unwrap().unwrap().holder, b);
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let memory = Arc::new(MemoryBackend::new());
        let lease = lease_on(&memory);
        let (a, b) = (InstanceId::from_raw("inst_a"), InstanceId::from_raw("inst_b"));
        assert!(lease.try_acquire(&sid(), &a).await.unwrap());
        assert!(!lease.release(&sid(), &b).await.unwrap());
        assert!(lease.release(&sid(), &a).await.unwrap());
        assert!(lease.holder(&sid()).await.unwrap().is_none());
        assert!(lease.try_acquire(&sid(), &b).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_lease_past_ttl() {
        let memory = Arc::new(MemoryBackend::new());
        let lease = lease_on(&memory);
        let a = InstanceId::from_raw("inst_a");
        assert!(lease.try_acquire(&sid(), &a).await.unwrap());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_renewal(lease.clone(), sid(), a.clone(), cancel.clone()));
        tokio::time::sleep(TTL * 3).await;
        assert_eq!(lease.holder(&sid()).await.unwrap().unwrap().holder, a);

        cancel.cancel();
        assert_eq!(task.await.unwrap(), RenewalOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_detects_takeover() {
        let memory = Arc::new(MemoryBackend::new());
        let lease = lease_on(&memory);
        let (a, b) = (InstanceId::from_raw("inst_a"), InstanceId::from_raw("inst_b"));
        assert!(lease.try_acquire(&sid(), &a).await.unwrap());
        let task = tokio::spawn(run_renewal(lease.clone(), sid(), a.clone(), CancellationToken::new()));

        // Simulate a partition long enough for the lease to be stolen.
        assert!(lease.release(&sid(), &a).await.unwrap());
        assert!(lease.try_acquire(&sid(), &b).await.unwrap());

        assert_eq!(task.await.unwrap(), RenewalOutcome::Lost);
        assert_eq!(lease.holder(&sid()).await.unwrap().unwrap().holder, b);
    }

    /// Leases where one holder's renewals stop reaching the store once `cut`
    /// is set, while every other instance still sees it normally.
    struct PartitionedLeases {
        inner: Arc<MemoryBackend>,
        isolated: InstanceId,
        cut: std::sync::atomic::AtomicBool,
        hang: bool,
    }

    impl PartitionedLeases {
        fn isolate(&self) {
            self.cut.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl LeaseBackend for PartitionedLeases {
        async fn try_acquire(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool> {
            self.inner.try_acquire(session, holder, ttl).await
        }

        async fn renew(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool> {
            if holder == &self.isolated && self.cut.load(std::sync::atomic::Ordering::SeqCst) {
                if self.hang {
                    return std::future::pending().await;
                }
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.renew(session, holder, ttl).await
        }

        async fn release(&self, session: &SessionId, holder: &InstanceId) -> Result<bool> {
            self.inner.release(session, holder).await
        }

        async fn current(&self, session: &SessionId) -> Result<Option<crate::backend::StoredLease>> {
            self.inner.current(session).await
        }

        async fn purge_expired(&self) -> Result<usize> {
            LeaseBackend::purge_expired(&*self.inner).await
        }
    }

    /// Run `a`'s renewal behind a partition that opens at `cut_after`, while
    /// `b` polls for the lease. Returns when `a` reported loss and when `b`
    /// acquired.
    async fn partitioned_takeover(ttl: Duration, renew: Duration, op_timeout: Duration, hang: bool, cut_after: Duration) -> (Instant, Instant) {
        let memory = Arc::new(MemoryBackend::new());
        let (a, b) = (InstanceId::from_raw("inst_a"), InstanceId::from_raw("inst_b"));
        let partitioned = Arc::new(PartitionedLeases {
            inner: memory.clone(),
            isolated: a.clone(),
            cut: std::sync::atomic::AtomicBool::new(false),
            hang,
        });
        let a_backend = Backend {
            leases: partitioned.clone(),
            ..Backend::from_memory(memory.clone())
        };
        let a_lease = OwnershipLease::new(&a_backend, ttl, renew, op_timeout);
        let b_lease = OwnershipLease::new(&Backend::from_memory(memory), ttl, renew, op_timeout);

        assert!(a_lease.try_acquire(&sid(), &a).await.unwrap());
        let holder = tokio::spawn(async move {
            let outcome = run_renewal(a_lease, sid(), a, CancellationToken::new()).await;
            (outcome, Instant::now())
        });
        let contender = tokio::spawn(async move {
            loop {
                if b_lease.try_acquire(&sid(), &b).await.unwrap() {
                    return Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        tokio::time::sleep(cut_after).await;
        partitioned.isolate();

        let (outcome, lost_at) = holder.await.unwrap();
        assert_eq!(outcome, RenewalOutcome::Lost);
        (lost_at, contender.await.unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn partitioned_holder_stops_before_takeover() {
        // 10s does not divide into 4s ticks, so expiry falls between ticks.
        let (lost_at, acquired_at) = partitioned_takeover(
            Duration::from_secs(10),
            Duration::from_secs(4),
            Duration::from_secs(2),
            false,
            Duration::from_millis(5_500),
        )
        .await;
        assert!(lost_at <= acquired_at, "holder kept the lease {:?} past takeover", lost_at - acquired_at);
    }

    #[tokio::test(start_paused = true)]
    async fn lapse_fires_while_renew_is_still_pending() {
        // Store calls may block far longer than the lease lives.
        let (lost_at, acquired_at) = partitioned_takeover(
            Duration::from_secs(10),
            Duration::from_secs(4),
            Duration::from_secs(30),
            true,
            Duration::from_millis(2_500),
        )
        .await;
        assert!(lost_at <= acquired_at, "holder kept the lease {:?} past takeover", lost_at - acquired_at);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_gives_up_during_store_outage() {
        let memory = Arc::new(MemoryBackend::new());
        let lease = lease_on(&memory);
        let a = InstanceId::from_raw("inst_a");
        assert!(lease.try_acquire(&sid(), &a).await.unwrap());
        let started = Instant::now();
        let task = tokio::spawn(run_renewal(lease.clone(), sid(), a, CancellationToken::new()));

        memory.set_available(false);
        assert_eq!(task.await.unwrap(), RenewalOutcome::Lost);
        assert!(started.elapsed() <= TTL - lease.safety_margin());
    }

    #[test]
    fn safety_margin_leaves_room_for_healthy_renewals() {
        let backend = Backend::memory();
        let lease = OwnershipLease::new(&backend, TTL, RENEW, Duration::from_secs(2));
        assert_eq!(lease.safety_margin(), Duration::from_secs(2));
        let slow_store = OwnershipLease::new(&backend, TTL, RENEW, Duration::from_secs(30));
        assert_eq!(slow_store.safety_margin(), Duration::from_secs(5));
        let tight = OwnershipLease::new(&backend, RENEW, RENEW, Duration::from_secs(2));
        assert_eq!(tight.safety_margin(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn brief_outage_is_survived() {
        let memory = Arc::new(MemoryBackend::new());
        let lease = lease_on(&memory);
        let a = InstanceId::from_raw("inst_a");
        assert!(lease.try_acquire(&sid(), &a).await.unwrap());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_renewal(lease.clone(), sid(), a.clone(), cancel.clone()));

        memory.set_available(false);
        tokio::time::sleep(RENEW + Duration::from_secs(1)).await;
        memory.set_available(true);
        tokio::time::sleep(RENEW * 4).await;

        assert!(!task.is_finished());
        assert_eq!(lease.holder(&sid()).await.unwrap().unwrap().holder, a);
        cancel.cancel();
        assert_eq!(task.await.unwrap(), RenewalOutcome::Stopped);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn concurrent_acquire_has_exactly_one_winner(instances in 2usize..16) {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(4)
                    .enable_all()
                    .build()
                    .unwrap();
                let winners = rt.block_on(async move {
                    let memory = Arc::new(MemoryBackend::new());
                    let lease = lease_on(&memory);
                    let barrier = Arc::new(tokio::sync::Barrier::new(instances));
                    let mut handles = Vec::new();
                    for i in 0..instances {
                        let lease = lease.clone();
                        let barrier = barrier.clone();
                        handles.push(tokio::spawn(async move {
                            let _ = barrier.wait().await;
                            lease
                                .try_acquire(&sid(), &InstanceId::from_raw(format!("inst_{i}")))
                                .await
                                .unwrap()
                        }));
                    }
                    let mut winners = 0;
                    for h in handles {
                        if h.await.unwrap() {
                            winners += 1;
                        }
                    }
                    winners
                });
                prop_assert_eq!(winners, 1);
            }
        }
    }
}
