//! Session bootstrap endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jobline_core::protocol::ErrorBody;
use jobline_core::retry::ReconnectPolicy;
use jobline_core::{RelayError, SessionId};
use jobline_store::{SessionSummary, StoreError};
use serde::Serialize;
use tracing::{info, warn};

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct CreatedSession {
    pub session_id: SessionId,
    /// Backoff parameters the browser uses for its control socket.
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
}

/// A [`RelayError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            code: self.0.code().to_owned(),
            message: self.0.to_string(),
        };
        (status, Json(serde_json::json!({ "error": body }))).into_response()
    }
}

/// POST /api/session
pub async fn create_session(State(state): State<AppState>) -> Result<Json<CreatedSession>, ApiError> {
    let session_id = state.relay.store().create().await.map_err(|e| {
        warn!(error = %e, "session create failed");
        ApiError::from(e)
    })?;
    info!(session_id = %session_id, "session created");
    Ok(Json(CreatedSession {
        session_id,
        reconnect: state.reconnect.clone(),
    }))
}

/// GET /api/sessions
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<SessionList>, ApiError> {
    let sessions = state.relay.store().list_active_with_metadata().await?;
    Ok(Json(SessionList { sessions }))
}
