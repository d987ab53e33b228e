//! # jobline-telemetry
//!
//! Structured logging via `tracing-subscriber` and a Prometheus metrics
//! recorder. Call [`init_telemetry`] once at startup.

#![deny(unsafe_code)]

pub mod metrics;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable single line.
    Compact,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive (e.g. `info` or `info,jobline_relay=debug`).
    /// Overridden by the `RUST_LOG` env var.
    pub filter: String,
    pub format: LogFormat,
    /// Whether to install the global Prometheus recorder.
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Json,
            metrics_enabled: true,
        }
    }
}

/// Errors raised while installing telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("tracing subscriber already installed: {0}")]
    Subscriber(String),
    #[error("metrics recorder install failed: {0}")]
    Metrics(String),
}

/// Keeps telemetry handles alive for the life of the process.
pub struct TelemetryGuard {
    prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl TelemetryGuard {
    /// Handle used to render `/metrics`, when metrics are enabled.
    pub fn prometheus(&self) -> Option<&metrics_exporter_prometheus::PrometheusHandle> {
        self.prometheus.as_ref()
    }
}

/// Build the env filter: `RUST_LOG` if set and valid, else `default_filter`.
pub fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Initialize logging (and optionally metrics). Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let filter = env_filter(&config.filter);

    let fmt_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    let prometheus = if config.metrics_enabled {
        Some(metrics::install_recorder()?)
    } else {
        None
    };

    Ok(TelemetryGuard { prometheus })
}
