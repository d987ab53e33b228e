use crate::ids::SessionId;

/// Relay-level failures, shared by the store, bridge and server layers.
///
/// `code()` is what browsers see in `error` and `connection_error`
/// messages, so the strings are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("ownership lease lost for session {0}")]
    LeaseLost(SessionId),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream disconnected after {attempts} reconnect attempts")]
    UpstreamDisconnected { attempts: u32 },
    #[error("version conflict on session {0}")]
    VersionConflict(SessionId),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("job catalog error: {0}")]
    Catalog(String),
}

impl RelayError {
    /// Machine-readable classification.
    pub fn code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::SessionNotFound(_) => "session_not_found",
            Self::LeaseLost(_) => "lease_lost",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamDisconnected { .. } => "upstream_disconnected",
            Self::VersionConflict(_) => "version_conflict",
            Self::MalformedMessage(_) => "malformed_message",
            Self::Catalog(_) => "catalog_error",
        }
    }

    /// Whether a browser reconnect may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::LeaseLost(_)
                | Self::UpstreamUnavailable(_)
                | Self::UpstreamDisconnected { .. }
                | Self::VersionConflict(_)
        )
    }

    /// Whether the local upstream bridge must stop when this occurs.
    pub fn is_fatal_to_bridge(&self) -> bool {
        matches!(
            self,
            Self::LeaseLost(_) | Self::UpstreamUnavailable(_) | Self::UpstreamDisconnected { .. }
        )
    }
}
