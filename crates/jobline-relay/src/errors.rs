use jobline_core::RelayError;
use thiserror::Error;

/// Failures talking to the job catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog returned status {0}")]
    Status(u16),
    #[error("unexpected catalog response: {0}")]
    Decode(String),
}

/// Failures on the upstream realtime connection.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream connect failed: {0}")]
    Connect(String),
    #[error("upstream connect timed out after {0}s")]
    ConnectTimeout(u64),
    #[error("upstream rejected the handshake: {0}")]
    Handshake(String),
    #[error("upstream connection closed")]
    Closed,
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for UpstreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            WsError::Http(response) => Self::Handshake(format!("HTTP {}", response.status())),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<CatalogError> for RelayError {
    fn from(e: CatalogError) -> Self {
        RelayError::Catalog(e.to_string())
    }
}

impl From<UpstreamError> for RelayError {
    fn from(e: UpstreamError) -> Self {
        RelayError::UpstreamUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_errors_map_to_catalog_code() {
        let relay: RelayError = CatalogError::Status(503).into();
        assert_eq!(relay.code(), "catalog_error");
        assert!(!relay.is_retryable());
    }

    #[test]
    fn upstream_errors_are_fatal_to_bridge() {
        let relay: RelayError = UpstreamError::ConnectTimeout(10).into();
        assert_eq!(relay.code(), "upstream_unavailable");
        assert!(relay.is_fatal_to_bridge());
    }
}
