//! Bridges running on this instance, at most one per session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jobline_core::SessionId;
use jobline_store::StoreError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::{run_bridge, BridgeCommand, BridgeContext};

/// Commands buffered per bridge before audio starts being dropped.
const COMMAND_QUEUE: usize = 512;

/// This instance's relationship to a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Holds the lease and runs the bridge.
    Owner,
    /// Another instance owns the session; local sockets only observe.
    Observer,
}

struct BridgeHandle {
    generation: u64,
    commands: mpsc::Sender<BridgeCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct BridgeRegistry {
    ctx: BridgeContext,
    bridges: DashMap<SessionId, BridgeHandle>,
    /// Serializes claim attempts per session on this instance.
    claims: DashMap<SessionId, Arc<Mutex<()>>>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRegistry")
            .field("running", &self.bridges.len())
            .finish_non_exhaustive()
    }
}

impl BridgeRegistry {
    pub fn new(ctx: BridgeContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            bridges: DashMap::new(),
            claims: DashMap::new(),
            next_generation: AtomicU64::new(0),
        })
    }

    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    pub fn is_running(&self, session: &SessionId) -> bool {
        self.bridges.contains_key(session)
    }

    pub fn running_count(&self) -> usize {
        self.bridges.len()
    }

    /// Run the bridge for `session` here if this instance can take the lease.
    pub async fn ensure(self: &Arc<Self>, session: &SessionId) -> Result<Role, StoreError> {
        if self.is_running(session) {
            return Ok(Role::Owner);
        }
        let claim = self.claims.entry(session.clone()).or_default().clone();
        let role = {
            let _guard = claim.lock().await;
            self.claim_locked(session).await
        };
        let _ = self
            .claims
            .remove_if(session, |_, c| Arc::strong_count(c) <= 2);
        role
    }

    async fn claim_locked(self: &Arc<Self>, session: &SessionId) -> Result<Role, StoreError> {
        if self.is_running(session) {
            return Ok(Role::Owner);
        }
        if !self.ctx.lease.try_acquire(session, &self.ctx.instance_id).await? {
            // A concurrent claim on this instance may have won meanwhile.
            return Ok(if self.is_running(session) {
                Role::Owner
            } else {
                Role::Observer
            });
        }
        self.spawn(session.clone());
        Ok(Role::Owner)
    }

    fn spawn(self: &Arc<Self>, session: SessionId) {
        let Entry::Vacant(slot) = self.bridges.entry(session.clone()) else {
            return;
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let cancel = CancellationToken::new();

        let registry = Arc::clone(self);
        let ctx = self.ctx.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let exit = run_bridge(ctx, session.clone(), rx, token).await;
            let _ = registry
                .bridges
                .remove_if(&session, |_, h| h.generation == generation);
            debug!(session_id = %session, ?exit, "bridge task finished");
        });
        let _ = slot.insert(BridgeHandle {
            generation,
            commands,
            cancel,
            task,
        });
    }

    /// Hand `cmd` to the session's bridge. `false` if there is none or its
    /// queue is full.
    pub fn send(&self, session: &SessionId, cmd: BridgeCommand) -> bool {
        let Some(handle) = self.bridges.get(session) else {
            return false;
        };
        match handle.commands.try_send(cmd) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(session_id = %session, "bridge queue full, command dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Stop the session's bridge; it releases the lease as it exits.
    pub fn stop(&self, session: &SessionId) -> bool {
        match self.bridges.remove(session) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop every bridge and wait up to `timeout` for them to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        let sessions: Vec<SessionId> = self.bridges.iter().map(|e| e.key().clone()).collect();
        let mut tasks = Vec::with_capacity(sessions.len());
        for session in sessions {
            if let Some((_, handle)) = self.bridges.remove(&session) {
                handle.cancel.cancel();
                tasks.push(handle.task);
            }
        }
        if tasks.is_empty() {
            return;
        }
        let count = tasks.len();
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(count, "bridges did not stop before the shutdown timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::*;
    use jobline_core::InstanceId;
    use jobline_store::backend::MemoryBackend;

    #[tokio::test]
    async fn one_owner_per_session_across_instances() {
        let mut upstream = FakeUpstream::start().await;
        let memory = Arc::new(MemoryBackend::new());
        let a = Harness::new("inst_a", memory.clone(), &upstream.url);
        let b = Harness::new("inst_b", memory, &upstream.url);
        let sid = a.store().create().await.unwrap();

        let reg_a = BridgeRegistry::new(a.ctx.clone());
        let reg_b = BridgeRegistry::new(b.ctx.clone());
        assert_eq!(reg_a.ensure(&sid).await.unwrap(), Role::Owner);
        assert_eq!(reg_a.ensure(&sid).await.unwrap(), Role::Owner);
        assert_eq!(reg_b.ensure(&sid).await.unwrap(), Role::Observer);
        let _ws = upstream.accept().await;

        assert_eq!(
            a.ctx.lease.holder(&sid).await.unwrap().unwrap().holder,
            InstanceId::from_raw("inst_a")
        );
        reg_a.shutdown(WAIT).await;
        assert!(!reg_a.is_running(&sid));
        assert!(a.ctx.lease.holder(&sid).await.unwrap().is_none());
        assert_eq!(reg_b.ensure(&sid).await.unwrap(), Role::Owner);
        reg_b.shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn concurrent_local_claims_spawn_one_bridge() {
        let mut upstream = FakeUpstream::start().await;
        let h = Harness::new("inst_a", Arc::new(MemoryBackend::new()), &upstream.url);
        let sid = h.store().create().await.unwrap();
        let reg = BridgeRegistry::new(h.ctx.clone());

        let claims = (0..8).map(|_| {
            let reg = reg.clone();
            let sid = sid.clone();
            tokio::spawn(async move { reg.ensure(&sid).await.unwrap() })
        });
        for role in futures::future::join_all(claims).await {
            assert_eq!(role.unwrap(), Role::Owner);
        }
        assert_eq!(reg.running_count(), 1);
        let _ws = upstream.accept().await;
        reg.shutdown(WAIT).await;
    }

    #[tokio::test]
    async fn send_reaches_bridge_and_stop_releases() {
        let mut upstream = FakeUpstream::start().await;
        let h = Harness::new("inst_a", Arc::new(MemoryBackend::new()), &upstream.url);
        let sid = h.store().create().await.unwrap();
        let reg = BridgeRegistry::new(h.ctx.clone());

        assert!(!reg.send(&sid, BridgeCommand::ClearAudio));
        assert_eq!(reg.ensure(&sid).await.unwrap(), Role::Owner);
        let mut ws = upstream.accept().await;
        let _ = recv_kind(&mut ws, "session.update").await;

        assert!(reg.send(&sid, BridgeCommand::Audio("QUJD".into())));
        let append = recv_kind(&mut ws, "input_audio_buffer.append").await;
        assert_eq!(append["audio"], "QUJD");

        assert!(reg.stop(&sid));
        assert!(!reg.stop(&sid));
        tokio::time::timeout(WAIT, async {
            while h.ctx.lease.holder(&sid).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("lease not released");
    }

    #[tokio::test]
    async fn failed_bridge_leaves_registry() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = format!("ws://{}/v1/realtime", listener.local_addr().unwrap());
        drop(listener);
        let h = Harness::new("inst_a", Arc::new(MemoryBackend::new()), &dead);
        let sid = h.store().create().await.unwrap();
        let reg = BridgeRegistry::new(h.ctx.clone());

        assert_eq!(reg.ensure(&sid).await.unwrap(), Role::Owner);
        tokio::time::timeout(WAIT, async {
            while reg.is_running(&sid) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("bridge did not exit");
        assert!(h.ctx.lease.holder(&sid).await.unwrap().is_none());
    }
}
