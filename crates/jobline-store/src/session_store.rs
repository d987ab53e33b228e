//! Versioned session records.
//!
//! The store is the only durable copy of a session. Every write goes through
//! [`SessionStore::compare_and_set`]; [`SessionStore::mutate`] wraps the
//! read → apply → compare-and-set loop that all callers use.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobline_core::retry::calculate_backoff_delay_with_random;
use jobline_core::session::ViewMode;
use jobline_core::{Mutation, Session, SessionId, VersionedSession};
use jobline_telemetry::metrics::STORE_CAS_CONFLICTS_TOTAL;
use serde::Serialize;

use crate::backend::{Backend, RecordBackend, StoredRecord};
use crate::errors::{bounded, Result, StoreError};

/// Compare-and-set attempts before `mutate` gives up.
pub const MAX_CAS_ATTEMPTS: u32 = 32;

/// Minimal per-session metadata for session switchers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub view_mode: ViewMode,
}

/// Result of [`SessionStore::mutate`].
#[derive(Clone, Debug)]
pub struct MutationOutcome {
    /// The session as stored after the call.
    pub session: VersionedSession,
    /// Whether the mutation changed anything (and so was written).
    pub changed: bool,
}

#[derive(Clone)]
pub struct SessionStore {
    records: Arc<dyn RecordBackend>,
    ttl: Duration,
    op_timeout: Duration,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("ttl", &self.ttl)
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// `ttl` is the sliding inactivity expiry; `op_timeout` bounds each call.
    pub fn new(backend: &Backend, ttl: Duration, op_timeout: Duration) -> Self {
        Self {
            records: backend.records.clone(),
            ttl,
            op_timeout,
        }
    }

    /// Idle time after which an untouched session expires.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Contract
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn create(&self) -> Result<SessionId> {
        Ok(self.create_session().await?.session.id)
    }

    /// Create and return a fresh session at version 1.
    pub async fn create_session(&self) -> Result<VersionedSession> {
        let session = Session::new(SessionId::new(), Utc::now());
        let body = session.encode()?;
        let inserted = bounded(
            self.op_timeout,
            "insert",
            self.records.insert_new(&session.id, &body, self.ttl),
        )
        .await?;
        if !inserted {
            // uuid v7 collision; never expected.
            return Err(StoreError::Conflict(session.id));
        }
        tracing::debug!(session_id = %session.id, "session created");
        Ok(VersionedSession {
            version: 1,
            session,
        })
    }

    /// Read a session. Does not slide the TTL.
    pub async fn get(&self, id: &SessionId) -> Result<VersionedSession> {
        let record = bounded(self.op_timeout, "load", self.records.load(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        decode(id, record)
    }

    /// Write `session` if the stored version is still `expected_version`.
    pub async fn compare_and_set(
        &self,
        id: &SessionId,
        expected_version: u64,
        session: &Session,
    ) -> Result<bool> {
        Ok(self.swap(id, expected_version, session).await?.is_some())
    }

    /// Like [`compare_and_set`](Self::compare_and_set) but returns the new
    /// version on success.
    pub async fn swap(
        &self,
        id: &SessionId,
        expected_version: u64,
        session: &Session,
    ) -> Result<Option<u64>> {
        let body = session.encode()?;
        bounded(
            self.op_timeout,
            "compare_and_set",
            self.records
                .compare_and_swap(id, expected_version, &body, self.ttl),
        )
        .await
    }

    /// Slide the TTL and record activity. `false` if the session is gone.
    pub async fn touch(&self, id: &SessionId) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        bounded(
            self.op_timeout,
            "touch",
            self.records.touch(id, now_ms, self.ttl),
        )
        .await
    }

    /// Remove the record and its index entry. Idempotent.
    pub async fn delete(&self, id: &SessionId) -> Result<()> {
        bounded(self.op_timeout, "delete", self.records.remove(id)).await
    }

    /// Ids of sessions whose records still exist.
    pub async fn list_active(&self) -> Result<Vec<SessionId>> {
        let mut active = Vec::new();
        for id in self.index_members().await? {
            if bounded(self.op_timeout, "load", self.records.load(&id))
                .await?
                .is_some()
            {
                active.push(id);
            }
        }
        Ok(active)
    }

    pub async fn list_active_with_metadata(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for id in self.index_members().await? {
            match self.get(&id).await {
                Ok(v) => summaries.push(SessionSummary {
                    id: v.session.id,
                    created_at: v.session.created_at,
                    last_activity: v.session.last_activity,
                    view_mode: v.session.view_mode,
                }),
                Err(StoreError::NotFound(_)) => {}
                Err(StoreError::Corrupt { id, reason }) => {
                    tracing::warn!(session_id = %id, reason, "skipping corrupt session");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation entry point
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply `mutation` with optimistic concurrency: read, apply, then
    /// compare-and-set, re-reading on conflict.
    pub async fn mutate(&self, id: &SessionId, mutation: &Mutation) -> Result<MutationOutcome> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(id).await?;
            let mut next = current.session.clone();
            if !mutation.apply(&mut next, Utc::now()) {
                return Ok(MutationOutcome {
                    session: current,
                    changed: false,
                });
            }
            if let Some(version) = self.swap(id, current.version, &next).await? {
                tracing::debug!(
                    session_id = %id,
                    mutation = mutation.kind(),
                    version,
                    "session mutated"
                );
                return Ok(MutationOutcome {
                    session: VersionedSession {
                        version,
                        session: next,
                    },
                    changed: true,
                });
            }
            metrics::counter!(STORE_CAS_CONFLICTS_TOTAL).increment(1);
            let pause = calculate_backoff_delay_with_random(attempt.min(4), 2, 50, 0.5, rand::random());
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
        tracing::warn!(
            session_id = %id,
            mutation = mutation.kind(),
            attempts = MAX_CAS_ATTEMPTS,
            "compare-and-set attempts exhausted"
        );
        Err(StoreError::Conflict(id.clone()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance (used by the sweeper)
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn index_members(&self) -> Result<Vec<SessionId>> {
        bounded(self.op_timeout, "index_members", self.records.index_members()).await
    }

    /// Drop index entries whose record no longer exists.
    pub async fn prune_index(&self) -> Result<usize> {
        let mut orphaned = Vec::new();
        for id in self.index_members().await? {
            if bounded(self.op_timeout, "load", self.records.load(&id))
                .await?
                .is_none()
            {
                orphaned.push(id);
            }
        }
        if orphaned.is_empty() {
            return Ok(0);
        }
        bounded(
            self.op_timeout,
            "index_remove",
            self.records.index_remove(&orphaned),
        )
        .await
    }

    /// Physically delete lapsed records (no-op where the store expires keys).
    pub async fn purge_expired(&self) -> Result<usize> {
        bounded(self.op_timeout, "purge_sessions", self.records.purge_expired()).await
    }
}

fn decode(id: &SessionId, record: StoredRecord) -> Result<VersionedSession> {
    let mut session = Session::decode(&record.body).map_err(|e| StoreError::Corrupt {
        id: id.clone(),
        reason: e.to_string(),
    })?;
    if let Some(touched) = record
        .touched_at_ms
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    {
        if touched > session.last_activity {
            session.last_activity = touched;
        }
    }
    Ok(VersionedSession {
        version: record.version,
        session,
    })
}
