//! `SQLite` backend.
//!
//! Uses `r2d2` connection pooling with the `r2d2_sqlite` manager; every call
//! runs on the blocking pool. Each compare-and-set and lease transition is a
//! single conditional statement, so concurrent writers through separate pooled
//! connections still observe exactly one winner.
//!
//! `SQLite` has no change feed; the broadcaster polls this backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobline_core::{InstanceId, SessionId};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

use super::{LeaseBackend, RecordBackend, StoredLease, StoredRecord};
use crate::errors::Result;

type ConnectionPool = Pool<SqliteConnectionManager>;

/// Source of "now" in unix milliseconds. Expiry columns are compared against
/// it, so tests can substitute a manual clock.
pub type SqliteClock = Arc<dyn Fn() -> i64 + Send + Sync>;

const BUSY_TIMEOUT_MS: u32 = 5_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id            TEXT PRIMARY KEY,
    version       INTEGER NOT NULL,
    body          TEXT NOT NULL,
    touched_at_ms INTEGER,
    expires_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS active_sessions (
    id TEXT PRIMARY KEY
);
CREATE TABLE IF NOT EXISTS leases (
    session_id    TEXT PRIMARY KEY,
    holder        TEXT NOT NULL,
    expires_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_expiry ON sessions(expires_at_ms);
";

/// Pragmas applied to each new pooled connection.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
    }
}

pub struct SqliteBackend {
    pool: ConnectionPool,
    clock: SqliteClock,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path`. Blocking.
    pub fn open(path: &str, pool_size: u32) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(Duration::from_secs(5))
            .connection_customizer(Box::new(PragmaCustomizer {
                busy_timeout_ms: BUSY_TIMEOUT_MS,
            }))
            .build(manager)?;
        pool.get()?.execute_batch(SCHEMA)?;
        tracing::debug!(path, pool_size, "sqlite store opened");
        Ok(Self {
            pool,
            clock: Arc::new(|| Utc::now().timestamp_millis()),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SqliteClock) -> Self {
        self.clock = clock;
        self
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, i64) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let now = (self.clock)();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn, now)
        })
        .await?
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn to_sql_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

fn from_sql_version(version: i64) -> u64 {
    u64::try_from(version).unwrap_or(0)
}

#[async_trait]
impl RecordBackend for SqliteBackend {
    async fn load(&self, id: &SessionId) -> Result<Option<StoredRecord>> {
        let id = id.to_string();
        self.run(move |conn, now| {
            let row = conn
                .query_row(
                    "SELECT version, body, touched_at_ms FROM sessions
                     WHERE id = ?1 AND expires_at_ms > ?2",
                    params![id, now],
                    |row| {
                        Ok(StoredRecord {
                            version: from_sql_version(row.get(0)?),
                            body: row.get(1)?,
                            touched_at_ms: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn insert_new(&self, id: &SessionId, body: &str, ttl: Duration) -> Result<bool> {
        let (id, body) = (id.to_string(), body.to_owned());
        self.run(move |conn, now| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO sessions (id, version, body, touched_at_ms, expires_at_ms)
                 VALUES (?1, 1, ?2, NULL, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    version = 1,
                    body = excluded.body,
                    touched_at_ms = NULL,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE sessions.expires_at_ms <= ?4",
                params![id, body, now.saturating_add(ttl_ms(ttl)), now],
            )? == 1;
            if inserted {
                let _ = tx.execute(
                    "INSERT OR IGNORE INTO active_sessions (id) VALUES (?1)",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        id: &SessionId,
        expected: u64,
        body: &str,
        ttl: Duration,
    ) -> Result<Option<u64>> {
        let (id, body) = (id.to_string(), body.to_owned());
        self.run(move |conn, now| {
            let changed = conn.execute(
                "UPDATE sessions
                 SET version = version + 1, body = ?1, touched_at_ms = NULL, expires_at_ms = ?2
                 WHERE id = ?3 AND version = ?4 AND expires_at_ms > ?5",
                params![
                    body,
                    now.saturating_add(ttl_ms(ttl)),
                    id,
                    to_sql_version(expected),
                    now
                ],
            )?;
            Ok((changed == 1).then_some(expected + 1))
        })
        .await
    }

    async fn touch(&self, id: &SessionId, now_ms: i64, ttl: Duration) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn, now| {
            let changed = conn.execute(
                "UPDATE sessions SET touched_at_ms = ?1, expires_at_ms = ?2
                 WHERE id = ?3 AND expires_at_ms > ?4",
                params![now_ms, now.saturating_add(ttl_ms(ttl)), id, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn remove(&self, id: &SessionId) -> Result<()> {
        let id = id.to_string();
        self.run(move |conn, _| {
            let tx = conn.transaction()?;
            let _ = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            let _ = tx.execute("DELETE FROM active_sessions WHERE id = ?1", params![id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn index_members(&self) -> Result<Vec<SessionId>> {
        self.run(|conn, _| {
            let mut stmt = conn.prepare("SELECT id FROM active_sessions ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|r| r.map(SessionId::from_raw))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn index_remove(&self, ids: &[SessionId]) -> Result<usize> {
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        self.run(move |conn, _| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            for id in &ids {
                removed += tx.execute("DELETE FROM active_sessions WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.run(|conn, now| {
            Ok(conn.execute(
                "DELETE FROM sessions WHERE expires_at_ms <= ?1",
                params![now],
            )?)
        })
        .await
    }
}

#[async_trait]
impl LeaseBackend for SqliteBackend {
    async fn try_acquire(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool> {
        let (session, holder) = (session.to_string(), holder.to_string());
        self.run(move |conn, now| {
            let changed = conn.execute(
                "INSERT INTO leases (session_id, holder, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                    holder = excluded.holder,
                    expires_at_ms = excluded.expires_at_ms
                 WHERE leases.expires_at_ms <= ?4",
                params![session, holder, now.saturating_add(ttl_ms(ttl)), now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn renew(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool> {
        let (session, holder) = (session.to_string(), holder.to_string());
        self.run(move |conn, now| {
            let changed = conn.execute(
                "UPDATE leases SET expires_at_ms = ?1
                 WHERE session_id = ?2 AND holder = ?3 AND expires_at_ms > ?4",
                params![now.saturating_add(ttl_ms(ttl)), session, holder, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release(&self, session: &SessionId, holder: &InstanceId) -> Result<bool> {
        let (session, holder) = (session.to_string(), holder.to_string());
        self.run(move |conn, _| {
            let changed = conn.execute(
                "DELETE FROM leases WHERE session_id = ?1 AND holder = ?2",
                params![session, holder],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn current(&self, session: &SessionId) -> Result<Option<StoredLease>> {
        let session = session.to_string();
        self.run(move |conn, now| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT holder, expires_at_ms FROM leases
                     WHERE session_id = ?1 AND expires_at_ms > ?2",
                    params![session, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.map(|(holder, expires_ms)| StoredLease {
                holder: InstanceId::from_raw(holder),
                expires_at: DateTime::<Utc>::from_timestamp_millis(expires_ms).unwrap_or_default(),
            }))
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.run(|conn, now| {
            Ok(conn.execute(
                "DELETE FROM leases WHERE expires_at_ms <= ?1",
                params![now],
            )?)
        })
        .await
    }
}
