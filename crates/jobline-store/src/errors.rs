use std::future::Future;
use std::time::Duration;

use jobline_core::{RelayError, SessionId};
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The shared store could not be reached or failed the call.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("session not found: {0}")]
    NotFound(SessionId),
    /// Compare-and-set retries were exhausted.
    #[error("version conflict on session {0}")]
    Conflict(SessionId),
    #[error("corrupt session record {id}: {reason}")]
    Corrupt { id: SessionId, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid store url: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(format!("sqlite: {e}"))
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        Self::Unavailable(format!("sqlite pool: {e}"))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Unavailable(format!("redis: {e}"))
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Unavailable(format!("store task failed: {e}"))
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => RelayError::SessionNotFound(id),
            StoreError::Conflict(id) => RelayError::VersionConflict(id),
            other => RelayError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Bound a store call by `limit`; elapsing counts as unavailability.
pub(crate) async fn bounded<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let result = match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "{op} timed out after {}ms",
            limit.as_millis()
        ))),
    };
    if let Err(StoreError::Unavailable(reason)) = &result {
        metrics::counter!(jobline_telemetry::metrics::STORE_UNAVAILABLE_TOTAL, "op" => op)
            .increment(1);
        tracing::warn!(op, reason = %reason, "store unavailable");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_session_not_found() {
        let relay: RelayError = StoreError::NotFound(SessionId::from_raw("sess_1")).into();
        assert_eq!(relay.code(), "session_not_found");
    }

    #[test]
    fn unavailable_maps_to_store_unavailable() {
        let relay: RelayError = StoreError::Unavailable("down".into()).into();
        assert_eq!(relay.code(), "store_unavailable");
    }

    #[test]
    fn conflict_maps_to_version_conflict() {
        let relay: RelayError = StoreError::Conflict(SessionId::from_raw("s")).into();
        assert_eq!(relay.code(), "version_conflict");
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out() {
        let result: Result<()> = bounded(Duration::from_millis(50), "load", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Unavailable(msg)) if msg.contains("load timed out")));
    }

    #[tokio::test]
    async fn bounded_passes_through() {
        let result = bounded(Duration::from_secs(1), "load", async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
