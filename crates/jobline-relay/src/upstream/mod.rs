//! Upstream realtime voice API client.
//!
//! The upstream protocol is fixed; this module only knows how to open the
//! socket, how to configure the voice session, and how to classify the
//! events that come back.

mod events;
mod outbox;

use std::time::Duration;

use jobline_settings::{UpstreamAuth, UpstreamSettings};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::errors::UpstreamError;
use crate::tools::tool_schemas;

pub use events::{strip_function_calls, UpstreamEvent};
pub use outbox::Outbox;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reconnect backoff base for mid-session drops.
pub const RECONNECT_BASE_MS: u64 = 250;
/// Reconnect backoff cap.
pub const RECONNECT_MAX_MS: u64 = 2_000;

/// Resolved upstream connection and voice-session settings.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub url: String,
    pub api_key: Option<SecretString>,
    pub auth: UpstreamAuth,
    pub voice: String,
    pub instructions: String,
    pub temperature: Option<f64>,
    pub max_response_output_tokens: Option<u32>,
    pub input_transcription_model: Option<String>,
    pub connect_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

impl From<&UpstreamSettings> for UpstreamConfig {
    fn from(s: &UpstreamSettings) -> Self {
        Self {
            url: s.url.clone(),
            api_key: s.api_key.clone(),
            auth: s.auth,
            voice: s.voice.clone(),
            instructions: s.instructions.clone(),
            temperature: s.temperature,
            max_response_output_tokens: s.max_response_output_tokens,
            input_transcription_model: s.input_transcription_model.clone(),
            connect_timeout: Duration::from_secs(s.connect_timeout_secs),
            max_reconnect_attempts: s.max_reconnect_attempts,
        }
    }
}

impl UpstreamConfig {
    /// The `session.update` command for this relay.
    ///
    /// Fields a browser supplied are kept unless the relay owns them
    /// (instructions, tools, voice, sampling limits); turn detection and
    /// transcription are defaulted only when absent.
    pub fn session_update(&self, client: Option<&Map<String, Value>>) -> Value {
        let mut session = client.cloned().unwrap_or_default();
        let _ = session
            .entry("turn_detection")
            .or_insert_with(|| json!({ "type": "server_vad" }));
        if let Some(model) = &self.input_transcription_model {
            let _ = session
                .entry("input_audio_transcription")
                .or_insert_with(|| json!({ "model": model }));
        }
        let _ = session.insert("instructions".into(), Value::String(self.instructions.clone()));
        let _ = session.insert("tools".into(), Value::Array(tool_schemas()));
        let _ = session.insert("tool_choice".into(), Value::String("auto".into()));
        let _ = session.insert("voice".into(), Value::String(self.voice.clone()));
        if let Some(t) = self.temperature {
            let _ = session.insert("temperature".into(), json!(t));
        }
        if let Some(max) = self.max_response_output_tokens {
            let _ = session.insert("max_response_output_tokens".into(), json!(max));
        }
        json!({ "type": "session.update", "session": session })
    }
}

/// Open the upstream socket, bounded by the connect timeout.
pub async fn connect(config: &UpstreamConfig) -> Result<UpstreamSocket, UpstreamError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| UpstreamError::Connect(e.to_string()))?;
    if let Some(key) = &config.api_key {
        let (name, value) = match config.auth {
            UpstreamAuth::ApiKey => ("api-key", key.expose_secret().to_owned()),
            UpstreamAuth::Bearer => ("authorization", format!("Bearer {}", key.expose_secret())),
        };
        let mut value =
            HeaderValue::from_str(&value).map_err(|e| UpstreamError::Connect(e.to_string()))?;
        value.set_sensitive(true);
        let _ = request.headers_mut().insert(name, value);
    }
    let _ = request
        .headers_mut()
        .insert("openai-beta", HeaderValue::from_static("realtime=v1"));

    let timeout_secs = config.connect_timeout.as_secs();
    let (socket, _) = tokio::time::timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| UpstreamError::ConnectTimeout(timeout_secs))??;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UpstreamConfig {
        UpstreamConfig::from(&UpstreamSettings::default())
    }

    #[test]
    fn session_update_carries_relay_fields() {
        let update = config().session_update(None);
        assert_eq!(update["type"], "session.update");
        let s = &update["session"];
        assert_eq!(s["turn_detection"]["type"], "server_vad");
        assert_eq!(s["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(s["tool_choice"], "auto");
        assert_eq!(s["voice"], "echo");
        assert_eq!(s["tools"].as_array().unwrap().len(), 2);
        assert!(s.get("temperature").is_none());
    }

    #[test]
    fn client_fields_survive_but_relay_fields_win() {
        let mut client = Map::new();
        let _ = client.insert("instructions".into(), json!("ignore me"));
        let _ = client.insert("turn_detection".into(), json!({"type": "none"}));
        let _ = client.insert("modalities".into(), json!(["text", "audio"]));
        let mut cfg = config();
        cfg.temperature = Some(0.6);

        let update = cfg.session_update(Some(&client));
        let s = &update["session"];
        assert_ne!(s["instructions"], "ignore me");
        assert_eq!(s["turn_detection"]["type"], "none");
        assert_eq!(s["modalities"][1], "audio");
        assert_eq!(s["temperature"], 0.6);
    }

    #[test]
    fn transcription_omitted_without_model() {
        let mut cfg = config();
        cfg.input_transcription_model = None;
        let update = cfg.session_update(None);
        assert!(update["session"].get("input_audio_transcription").is_none());
    }

    #[tokio::test]
    async fn connect_refused_is_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut cfg = config();
        cfg.url = format!("ws://{addr}/realtime");
        assert!(connect(&cfg).await.is_err());
    }
}
