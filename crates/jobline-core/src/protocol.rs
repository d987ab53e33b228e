//! Browser-facing message envelopes.
//!
//! Every frame is a JSON object tagged by `type`. Audio and transcript
//! messages reuse the realtime API's event names so a browser client can
//! treat relayed and server-originated events uniformly.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RelayError;
use crate::ids::SessionId;
use crate::snapshot::StateSnapshot;

/// Largest inbound text frame accepted, in bytes.
pub const MAX_INBOUND_FRAME_BYTES: usize = 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManualSearch {
    pub query: String,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectJob {
    pub job_id: String,
}

/// Messages a browser may send.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },
    #[serde(rename = "input_audio_buffer.clear")]
    AudioClear,
    #[serde(rename = "session.update")]
    SessionUpdate {
        #[serde(default)]
        session: Map<String, Value>,
    },
    #[serde(rename = "manual_search")]
    ManualSearch { data: ManualSearch },
    #[serde(rename = "select_job")]
    SelectJob { data: SelectJob },
    #[serde(rename = "view_search_results")]
    ViewSearchResults,
    #[serde(rename = "reset_state")]
    ResetState,
}

impl ClientMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        if text.len() > MAX_INBOUND_FRAME_BYTES {
            return Err(RelayError::MalformedMessage(format!(
                "frame of {} bytes exceeds limit",
                text.len()
            )));
        }
        let msg: Self = serde_json::from_str(text)
            .map_err(|e| RelayError::MalformedMessage(e.to_string()))?;
        if let Self::ManualSearch { data } = &msg {
            if data.query.trim().is_empty() {
                return Err(RelayError::MalformedMessage("empty search query".into()));
            }
        }
        Ok(msg)
    }

    /// Whether the message goes to the upstream voice API rather than
    /// directly to session state.
    pub fn is_upstream_bound(&self) -> bool {
        matches!(
            self,
            Self::AudioAppend { .. } | Self::AudioClear | Self::SessionUpdate { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioAppend { .. } => "input_audio_buffer.append",
            Self::AudioClear => "input_audio_buffer.clear",
            Self::SessionUpdate { .. } => "session.update",
            Self::ManualSearch { .. } => "manual_search",
            Self::SelectJob { .. } => "select_job",
            Self::ViewSearchResults => "view_search_results",
            Self::ResetState => "reset_state",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Messages the relay sends to a browser.
///
/// Upstream events without a dedicated variant are relayed verbatim and do
/// not pass through this enum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session.assigned")]
    SessionAssigned { session_id: SessionId },
    #[serde(rename = "state_update")]
    StateUpdate { data: StateSnapshot },
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio_transcript.delta")]
    TranscriptDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
        transcript: String,
    },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_id: Option<String>,
    },
    #[serde(rename = "response.done")]
    TurnComplete { response: Value },
    #[serde(rename = "extension.middle_tier_tool.response")]
    ToolResponse {
        tool_name: String,
        tool_result: String,
    },
    #[serde(rename = "error")]
    Error { error: ErrorBody },
    #[serde(rename = "connection_error")]
    ConnectionError {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl ServerMessage {
    pub fn state(snapshot: StateSnapshot) -> Self {
        Self::StateUpdate { data: snapshot }
    }

    /// Non-fatal error report for this socket.
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            error: ErrorBody {
                code: err.code().to_owned(),
                message: err.to_string(),
            },
        }
    }

    /// Error that ends the socket's participation; the client decides
    /// whether to reconnect from `retryable`.
    pub fn connection_error(err: &RelayError) -> Self {
        Self::ConnectionError {
            code: err.code().to_owned(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
