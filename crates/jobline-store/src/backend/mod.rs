//! Storage backends.
//!
//! A backend provides three capabilities, each behind its own trait:
//!
//! - [`RecordBackend`]: versioned session records with TTL plus the active index
//! - [`LeaseBackend`]: atomic set-if-absent-or-expired ownership leases
//! - [`ChangeFeed`]: optional cross-instance publish/subscribe of snapshots
//!
//! Every mutating operation is a single atomic step against the store; no
//! backend implements compare-and-set or lease acquisition as read-then-write.

mod memory;
mod redis_store;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use jobline_core::{InstanceId, SessionId};

use crate::errors::{Result, StoreError};

pub use self::memory::MemoryBackend;
pub use self::redis_store::RedisBackend;
pub use self::sqlite::{SqliteBackend, SqliteClock};

/// A stored session body and its version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub version: u64,
    pub body: String,
    /// Last `touch`, in unix milliseconds, when newer than the body.
    pub touched_at_ms: Option<i64>,
}

/// A live lease as seen by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredLease {
    pub holder: InstanceId,
    pub expires_at: DateTime<Utc>,
}

/// A snapshot payload delivered through the change feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedMessage {
    pub session_id: SessionId,
    pub payload: String,
}

#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn load(&self, id: &SessionId) -> Result<Option<StoredRecord>>;
    /// Write version 1 and add `id` to the index. `false` if a live record
    /// already exists.
    async fn insert_new(&self, id: &SessionId, body: &str, ttl: Duration) -> Result<bool>;
    /// Replace the body if the stored version equals `expected`. Returns the
    /// new version, or `None` when the version moved or the record is gone.
    async fn compare_and_swap(
        &self,
        id: &SessionId,
        expected: u64,
        body: &str,
        ttl: Duration,
    ) -> Result<Option<u64>>;
    /// Slide the TTL and record activity time. `false` if the record is gone.
    async fn touch(&self, id: &SessionId, now_ms: i64, ttl: Duration) -> Result<bool>;
    async fn remove(&self, id: &SessionId) -> Result<()>;
    async fn index_members(&self) -> Result<Vec<SessionId>>;
    async fn index_remove(&self, ids: &[SessionId]) -> Result<usize>;
    /// Physically delete lapsed records. Backends with native expiry return 0.
    async fn purge_expired(&self) -> Result<usize>;
}

#[async_trait]
pub trait LeaseBackend: Send + Sync {
    async fn try_acquire(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool>;
    async fn renew(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool>;
    /// Delete the lease if `holder` owns it. Returns whether it did.
    async fn release(&self, session: &SessionId, holder: &InstanceId) -> Result<bool>;
    async fn current(&self, session: &SessionId) -> Result<Option<StoredLease>>;
    async fn purge_expired(&self) -> Result<usize>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn publish(&self, session: &SessionId, payload: &str) -> Result<()>;
    /// Subscribe to every session's messages. Each call opens an independent
    /// subscription.
    async fn subscribe(&self) -> Result<BoxStream<'static, FeedMessage>>;
}

/// Connection tuning shared by all backends.
#[derive(Clone, Debug)]
pub struct BackendOptions {
    pub pool_size: u32,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self { pool_size: 8 }
    }
}

/// The three capabilities of one opened store.
#[derive(Clone)]
pub struct Backend {
    pub records: Arc<dyn RecordBackend>,
    pub leases: Arc<dyn LeaseBackend>,
    pub feed: Option<Arc<dyn ChangeFeed>>,
    pub kind: &'static str,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind)
            .field("has_feed", &self.feed.is_some())
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// A fresh in-memory store.
    pub fn memory() -> Self {
        Self::from_memory(Arc::new(MemoryBackend::new()))
    }

    /// Wrap an existing in-memory store (several `Backend`s may share one to
    /// simulate instances sharing a store).
    pub fn from_memory(memory: Arc<MemoryBackend>) -> Self {
        Self {
            records: memory.clone(),
            leases: memory.clone(),
            feed: Some(memory),
            kind: "memory",
        }
    }

    /// A SQLite store. No change feed; instances poll for remote updates.
    pub fn from_sqlite(sqlite: SqliteBackend) -> Self {
        let sqlite = Arc::new(sqlite);
        Self {
            records: sqlite.clone(),
            leases: sqlite,
            feed: None,
            kind: "sqlite",
        }
    }

    /// A Redis store, with pub/sub as its change feed.
    pub fn from_redis(redis: RedisBackend) -> Self {
        let redis = Arc::new(redis);
        Self {
            records: redis.clone(),
            leases: redis.clone(),
            feed: Some(redis),
            kind: "redis",
        }
    }
}

/// Open the backend named by `url`.
///
/// - `memory://`
/// - `sqlite://<path>` (`sqlite://:memory:` is rejected: each pooled
///   connection would see its own database)
/// - `redis://…` / `rediss://…`
pub async fn open_backend(url: &str, options: &BackendOptions) -> Result<Backend> {
    if url.starts_with("memory://") {
        return Ok(Backend::memory());
    }
    if let Some(path) = url.strip_prefix("sqlite://") {
        if path.is_empty() || path == ":memory:" {
            return Err(StoreError::InvalidUrl(format!(
                "sqlite url needs a file path: {url}"
            )));
        }
        let path = path.to_owned();
        let pool_size = options.pool_size;
        let backend =
            tokio::task::spawn_blocking(move || SqliteBackend::open(&path, pool_size)).await??;
        return Ok(Backend::from_sqlite(backend));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        return Ok(Backend::from_redis(RedisBackend::connect(url).await?));
    }
    Err(StoreError::InvalidUrl(url.to_owned()))
}
