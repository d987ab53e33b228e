//! The persisted session record and the mutations that may change it.
//!
//! Every change to a session, whether it comes from an assistant tool call or
//! a manual browser control, is expressed as a [`Mutation`] and applied
//! through the store's compare-and-set loop. Nothing else writes session
//! state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ids::SessionId;
use crate::snapshot::{StateSnapshot, StatusBanner};

/// Current on-store schema version of [`Session`].
pub const SCHEMA_VERSION: u32 = 1;
/// Maximum number of search results kept in session state.
pub const MAX_RESULTS: usize = 5;
/// Rolling transcript length.
pub const MAX_TRANSCRIPT_ENTRIES: usize = 50;

// ─────────────────────────────────────────────────────────────────────────────
// Record
// ─────────────────────────────────────────────────────────────────────────────

/// Which pane the UI shows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Search,
    Detail,
}

/// The last executed search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchState {
    pub query: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub total_count: u64,
}

/// A transient banner. Stored with its start time so every reader computes
/// the same countdown.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub text: String,
    pub set_at: DateTime<Utc>,
    pub duration_secs: u64,
}

impl StatusMessage {
    /// Whole seconds left before the banner lapses, rounded up.
    /// `None` once it has lapsed.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        let elapsed_ms = (now - self.set_at).num_milliseconds().max(0);
        let total_ms = i64::try_from(self.duration_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let left_ms = total_ms - elapsed_ms;
        if left_ms <= 0 {
            return None;
        }
        u64::try_from((left_ms + 999) / 1000).ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// A conversation's durable state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub schema_version: u32,
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub search_state: Option<SearchState>,
    #[serde(default)]
    pub current_job: Option<Value>,
    #[serde(default)]
    pub view_mode: ViewMode,
    #[serde(default)]
    pub status_message: Option<StatusMessage>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
}

/// A session together with the store version it was read at.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedSession {
    pub version: u64,
    pub session: Session,
}

impl VersionedSession {
    pub fn snapshot(&self, now: DateTime<Utc>) -> StateSnapshot {
        self.session.snapshot(self.version, now)
    }
}

/// Failure to decode a stored session body.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid session JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported session schema version {0}")]
    UnsupportedSchema(u32),
}

impl Session {
    /// A fresh, empty session.
    pub fn new(id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            id,
            created_at: now,
            last_activity: now,
            search_state: None,
            current_job: None,
            view_mode: ViewMode::Search,
            status_message: None,
            transcript: Vec::new(),
        }
    }

    /// Decode a stored body, rejecting unknown schema versions.
    pub fn decode(body: &str) -> Result<Self, DecodeError> {
        let mut session: Session = serde_json::from_str(body)?;
        if session.schema_version != SCHEMA_VERSION {
            return Err(DecodeError::UnsupportedSchema(session.schema_version));
        }
        session.normalize();
        Ok(session)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Restore `view_mode = detail ⇒ current_job != null`.
    pub fn normalize(&mut self) {
        if self.view_mode == ViewMode::Detail && self.current_job.is_none() {
            self.view_mode = ViewMode::Search;
        }
    }

    /// Full UI-relevant state at `version`.
    pub fn snapshot(&self, version: u64, now: DateTime<Utc>) -> StateSnapshot {
        StateSnapshot {
            session_id: self.id.clone(),
            version,
            search: self.search_state.clone(),
            current_job: self.current_job.clone(),
            view_mode: self.view_mode,
            status_message: self.status_message.as_ref().and_then(|s| {
                s.remaining_seconds(now).map(|remaining_seconds| StatusBanner {
                    text: s.text.clone(),
                    remaining_seconds,
                })
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mutations
// ─────────────────────────────────────────────────────────────────────────────

/// A single state change. Mutations replace whole fields rather than
/// patching them, so replaying one is harmless.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    SearchCompleted {
        query: String,
        country: Option<String>,
        results: Vec<Value>,
        total_count: u64,
    },
    JobSelected {
        job: Value,
    },
    ShowResults,
    Reset,
    SetStatus {
        text: String,
        duration_secs: u64,
    },
    /// Clear the banner. With `only_if`, only when it currently shows that text.
    ClearStatus {
        only_if: Option<String>,
    },
    AppendTranscript {
        role: Speaker,
        text: String,
    },
}

impl Mutation {
    /// Apply to `session`. Returns whether anything changed.
    pub fn apply(&self, session: &mut Session, now: DateTime<Utc>) -> bool {
        let changed = match self {
            Self::SearchCompleted {
                query,
                country,
                results,
                total_count,
            } => {
                session.search_state = Some(SearchState {
                    query: query.clone(),
                    country: country.clone(),
                    results: results.iter().take(MAX_RESULTS).cloned().collect(),
                    total_count: *total_count,
                });
                session.view_mode = ViewMode::Search;
                true
            }
            Self::JobSelected { job } => {
                session.current_job = Some(job.clone());
                session.view_mode = ViewMode::Detail;
                true
            }
            Self::ShowResults => {
                let changed = session.current_job.is_some() || session.view_mode != ViewMode::Search;
                session.current_job = None;
                session.view_mode = ViewMode::Search;
                changed
            }
            Self::Reset => {
                session.search_state = None;
                session.current_job = None;
                session.view_mode = ViewMode::Search;
                session.status_message = None;
                session.transcript.clear();
                true
            }
            Self::SetStatus {
                text,
                duration_secs,
            } => {
                session.status_message = Some(StatusMessage {
                    text: text.clone(),
                    set_at: now,
                    duration_secs: *duration_secs,
                });
                true
            }
            Self::ClearStatus { only_if } => match (&session.status_message, only_if) {
                (None, _) => false,
                (Some(current), Some(expected)) if &current.text != expected => false,
                _ => {
                    session.status_message = None;
                    true
                }
            },
            Self::AppendTranscript { role, text } => {
                session.transcript.push(TranscriptEntry {
                    role: *role,
                    text: text.clone(),
                    at: now,
                });
                let overflow = session.transcript.len().saturating_sub(MAX_TRANSCRIPT_ENTRIES);
                if overflow > 0 {
                    let _ = session.transcript.drain(..overflow);
                }
                true
            }
        };
        if changed {
            session.last_activity = now;
        }
        changed
    }

    /// Whether observers need a new snapshot after this mutation.
    pub fn is_visible(&self) -> bool {
        !matches!(self, Self::AppendTranscript { .. })
    }

    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SearchCompleted { .. } => "search_completed",
            Self::JobSelected { .. } => "job_selected",
            Self::ShowResults => "show_results",
            Self::Reset => "reset",
            Self::SetStatus { .. } => "set_status",
            Self::ClearStatus { .. } => "clear_status",
            Self::AppendTranscript { .. } => "append_transcript",
        }
    }
}
