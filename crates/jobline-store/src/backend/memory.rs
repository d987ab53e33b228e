//! Process-local backend.
//!
//! Expiry runs on `tokio::time::Instant`, so tests can drive TTLs with paused
//! time. One `MemoryBackend` behind an `Arc` can back several in-process
//! instances, which is how multi-instance scenarios are exercised.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use jobline_core::{InstanceId, SessionId};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use super::{ChangeFeed, FeedMessage, LeaseBackend, RecordBackend, StoredLease, StoredRecord};
use crate::errors::{Result, StoreError};

const FEED_CAPACITY: usize = 1024;

struct Entry {
    version: u64,
    body: String,
    touched_at_ms: Option<i64>,
    expires_at: Instant,
}

struct LeaseEntry {
    holder: InstanceId,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<SessionId, Entry>,
    index: HashSet<SessionId>,
    leases: HashMap<SessionId, LeaseEntry>,
}

impl MemoryState {
    fn live_record(&mut self, id: &SessionId, now: Instant) -> Option<&mut Entry> {
        self.records.get_mut(id).filter(|e| e.expires_at > now)
    }

    fn live_lease(&self, id: &SessionId, now: Instant) -> Option<&LeaseEntry> {
        self.leases.get(id).filter(|l| l.expires_at > now)
    }
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    feed: broadcast::Sender<FeedMessage>,
    available: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            state: Mutex::new(MemoryState::default()),
            feed,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store becoming unreachable (`false`) or recovering.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl RecordBackend for MemoryBackend {
    async fn load(&self, id: &SessionId) -> Result<Option<StoredRecord>> {
        self.check()?;
        let mut state = self.state.lock();
        Ok(state.live_record(id, Instant::now()).map(|e| StoredRecord {
            version: e.version,
            body: e.body.clone(),
            touched_at_ms: e.touched_at_ms,
        }))
    }

    async fn insert_new(&self, id: &SessionId, body: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.live_record(id, now).is_some() {
            return Ok(false);
        }
        let _ = state.records.insert(
            id.clone(),
            Entry {
                version: 1,
                body: body.to_owned(),
                touched_at_ms: None,
                expires_at: now + ttl,
            },
        );
        let _ = state.index.insert(id.clone());
        Ok(true)
    }

    async fn compare_and_swap(
        &self,
        id: &SessionId,
        expected: u64,
        body: &str,
        ttl: Duration,
    ) -> Result<Option<u64>> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(entry) = state.live_record(id, now) else {
            return Ok(None);
        };
        if entry.version != expected {
            return Ok(None);
        }
        entry.version += 1;
        entry.body = body.to_owned();
        entry.touched_at_ms = None;
        entry.expires_at = now + ttl;
        Ok(Some(entry.version))
    }

    async fn touch(&self, id: &SessionId, now_ms: i64, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        Ok(match state.live_record(id, now) {
            Some(entry) => {
                entry.touched_at_ms = Some(now_ms);
                entry.expires_at = now + ttl;
                true
            }
            None => false,
        })
    }

    async fn remove(&self, id: &SessionId) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        let _ = state.records.remove(id);
        let _ = state.index.remove(id);
        Ok(())
    }

    async fn index_members(&self) -> Result<Vec<SessionId>> {
        self.check()?;
        let state = self.state.lock();
        let mut ids: Vec<SessionId> = state.index.iter().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn index_remove(&self, ids: &[SessionId]) -> Result<usize> {
        self.check()?;
        let mut state = self.state.lock();
        Ok(ids.iter().filter(|id| state.index.remove(*id)).count())
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.records.len();
        state.records.retain(|_, e| e.expires_at > now);
        Ok(before - state.records.len())
    }
}

#[async_trait]
impl LeaseBackend for MemoryBackend {
    async fn try_acquire(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.live_lease(session, now).is_some() {
            return Ok(false);
        }
        let _ = state.leases.insert(
            session.clone(),
            LeaseEntry {
                holder: holder.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.leases.get_mut(session) {
            Some(lease) if lease.expires_at > now && &lease.holder == holder => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, session: &SessionId, holder: &InstanceId) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock();
        if state.leases.get(session).is_some_and(|l| &l.holder == holder) {
            let _ = state.leases.remove(session);
            return Ok(true);
        }
        Ok(false)
    }

    async fn current(&self, session: &SessionId) -> Result<Option<StoredLease>> {
        self.check()?;
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state.live_lease(session, now).map(|l| {
            let left = l.expires_at.saturating_duration_since(now);
            StoredLease {
                holder: l.holder.clone(),
                expires_at: Utc::now()
                    + chrono::Duration::from_std(left).unwrap_or_else(|_| chrono::Duration::zero()),
            }
        }))
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.check()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.leases.len();
        state.leases.retain(|_, l| l.expires_at > now);
        Ok(before - state.leases.len())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn publish(&self, session: &SessionId, payload: &str) -> Result<()> {
        self.check()?;
        // No subscribers is not an error.
        let _ = self.feed.send(FeedMessage {
            session_id: session.clone(),
            payload: payload.to_owned(),
        });
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, FeedMessage>> {
        self.check()?;
        let stream = BroadcastStream::new(self.feed.subscribe()).filter_map(|msg| async move {
            match msg {
                Ok(msg) => Some(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "memory feed subscriber lagged");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
