//! Settings types with compiled defaults.

use jobline_core::retry::ReconnectPolicy;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{Result, SettingsError};

/// Default instructions sent to the realtime model.
pub const DEFAULT_INSTRUCTIONS: &str = "Start by greeting the user and asking what kind of job they're looking for.
You are a job search assistant. Help users search for jobs and display the results.
Before searching, make sure to ask:
1) What job role/title they're interested in
2) Which country they want to work in (optional)
";

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoblineSettings {
    /// Fixed instance id; generated at startup when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub lease: LeaseSettings,
    pub broadcast: BroadcastSettings,
    pub upstream: UpstreamSettings,
    pub catalog: CatalogSettings,
    /// Reconnect policy handed to browsers.
    pub client: ReconnectPolicy,
    pub logging: LoggingSettings,
}

/// HTTP/WebSocket listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (0 picks a free port).
    pub port: u16,
    /// Per-socket outbound queue length.
    pub max_send_queue: usize,
    /// Ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Disconnect after this long without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Grace period for background tasks on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
            max_send_queue: 512,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Shared store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// `memory://`, `sqlite://<path>` or `redis://…`.
    pub url: String,
    /// Sliding session TTL.
    pub session_expiry_seconds: u64,
    /// Sweeper interval.
    pub cleanup_interval_seconds: u64,
    /// Upper bound on any single store call.
    pub op_timeout_ms: u64,
    /// SQLite pool size.
    pub pool_size: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            session_expiry_seconds: 86_400,
            cleanup_interval_seconds: 300,
            op_timeout_ms: 2_000,
            pool_size: 8,
        }
    }
}

/// Ownership lease timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaseSettings {
    pub ttl_secs: u64,
    pub renew_interval_secs: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 15,
            renew_interval_secs: 5,
        }
    }
}

/// State broadcaster settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BroadcastSettings {
    /// Poll interval when the store has no change feed.
    pub poll_interval_ms: u64,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

/// How the API key is presented to the upstream service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamAuth {
    /// `api-key: <key>` header.
    #[default]
    ApiKey,
    /// `Authorization: Bearer <key>`.
    Bearer,
}

impl UpstreamAuth {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "api-key" | "apikey" => Some(Self::ApiKey),
            "bearer" => Some(Self::Bearer),
            _ => None,
        }
    }
}

/// Realtime voice API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    /// Full `wss://` URL including query parameters.
    pub url: String,
    #[serde(skip_serializing, deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    pub auth: UpstreamAuth,
    pub voice: String,
    pub instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<u32>,
    /// Enables input transcription when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_transcription_model: Option<String>,
    pub connect_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview".to_string(),
            api_key: None,
            auth: UpstreamAuth::ApiKey,
            voice: "echo".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            temperature: None,
            max_response_output_tokens: None,
            input_transcription_model: Some("whisper-1".to_string()),
            connect_timeout_secs: 10,
            max_reconnect_attempts: 3,
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .filter(|s| !s.is_empty())
        .map(|s| SecretString::from(s.as_str())))
}

/// Job catalog HTTP API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogSettings {
    pub base_url: String,
    pub language: String,
    pub page_size: u32,
    pub timeout_secs: u64,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            base_url: "https://gcsservices.careers.microsoft.com/search/api/v1".to_string(),
            language: "en_us".to_string(),
            page_size: 20,
            timeout_secs: 15,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Compact,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl JoblineSettings {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.lease.renew_interval_secs == 0 {
            return Err(invalid("lease.renewIntervalSecs must be at least 1"));
        }
        if self.lease.renew_interval_secs >= self.lease.ttl_secs {
            return Err(invalid(format!(
                "lease.renewIntervalSecs ({}) must be shorter than lease.ttlSecs ({})",
                self.lease.renew_interval_secs, self.lease.ttl_secs
            )));
        }
        if self.broadcast.poll_interval_ms == 0 || self.broadcast.poll_interval_ms > 1000 {
            return Err(invalid("broadcast.pollIntervalMs must be within 1..=1000"));
        }
        if self.store.session_expiry_seconds == 0 {
            return Err(invalid("store.sessionExpirySeconds must be at least 1"));
        }
        if self.store.cleanup_interval_seconds == 0 {
            return Err(invalid("store.cleanupIntervalSeconds must be at least 1"));
        }
        if self.store.op_timeout_ms == 0 {
            return Err(invalid("store.opTimeoutMs must be at least 1"));
        }
        let known_scheme = ["memory://", "sqlite://", "redis://", "rediss://"]
            .iter()
            .any(|scheme| self.store.url.starts_with(scheme));
        if !known_scheme {
            return Err(invalid(format!("unsupported store url: {}", self.store.url)));
        }
        if !(self.upstream.url.starts_with("ws://") || self.upstream.url.starts_with("wss://")) {
            return Err(invalid("upstream.url must be a ws:// or wss:// URL"));
        }
        if self.server.heartbeat_interval_secs == 0
            || self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs
        {
            return Err(invalid(
                "server.heartbeatTimeoutSecs must be at least server.heartbeatIntervalSecs",
            ));
        }
        if self.client.max_delay_ms < self.client.initial_delay_ms {
            return Err(invalid("client.maxDelayMs must be at least client.initialDelayMs"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue(msg.into())
}
