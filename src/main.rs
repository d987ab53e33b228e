//! # jobline
//!
//! Relay instance binary: loads settings, opens the shared store, wires the
//! relay and serves the HTTP/WebSocket surface until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use jobline_core::InstanceId;
use jobline_relay::bridge::BridgeContext;
use jobline_relay::{CareersCatalog, ConnectionHub, Relay, StateBroadcaster, UpstreamConfig};
use jobline_server::JoblineServer;
use jobline_settings::{JoblineSettings, LogFormat};
use jobline_store::{open_backend, BackendOptions, OwnershipLease, SessionStore, Sweeper};
use jobline_telemetry::TelemetryConfig;

/// Session-state sync and realtime relay.
#[derive(Parser, Debug)]
#[command(name = "jobline", about = "Session-state sync and realtime relay")]
struct Cli {
    /// JSON settings file (falls back to `JOBLINE_CONFIG`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Shared store URL (overrides settings).
    #[arg(long)]
    store_url: Option<String>,
}

impl Cli {
    fn config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| std::env::var_os("JOBLINE_CONFIG").map(PathBuf::from))
    }

    fn apply(&self, settings: &mut JoblineSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(url) = &self.store_url {
            settings.store.url.clone_from(url);
        }
    }
}

fn telemetry_config(settings: &JoblineSettings) -> TelemetryConfig {
    TelemetryConfig {
        filter: settings.logging.level.clone(),
        format: match settings.logging.format {
            LogFormat::Json => jobline_telemetry::LogFormat::Json,
            LogFormat::Compact => jobline_telemetry::LogFormat::Compact,
        },
        metrics_enabled: true,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = jobline_settings::load_settings(args.config_path().as_deref())
        .context("Failed to load settings")?;
    args.apply(&mut settings);

    let telemetry = jobline_telemetry::init_telemetry(&telemetry_config(&settings))
        .context("Failed to initialize telemetry")?;

    let instance_id = settings
        .instance_id
        .clone()
        .map_or_else(InstanceId::new, InstanceId::from_raw);

    let backend = open_backend(
        &settings.store.url,
        &BackendOptions {
            pool_size: settings.store.pool_size,
        },
    )
    .await
    .context("Failed to open session store")?;
    tracing::info!(backend = backend.kind, %instance_id, "session store ready");

    let op_timeout = Duration::from_millis(settings.store.op_timeout_ms);
    let store = SessionStore::new(
        &backend,
        Duration::from_secs(settings.store.session_expiry_seconds),
        op_timeout,
    );
    let lease = OwnershipLease::new(
        &backend,
        Duration::from_secs(settings.lease.ttl_secs),
        Duration::from_secs(settings.lease.renew_interval_secs),
        op_timeout,
    );
    let broadcaster = Arc::new(StateBroadcaster::new(
        instance_id.clone(),
        store.clone(),
        backend.feed.clone(),
        Arc::new(ConnectionHub::new()),
        Duration::from_millis(settings.broadcast.poll_interval_ms),
    ));
    if !broadcaster.uses_feed() {
        tracing::info!(
            poll_interval_ms = settings.broadcast.poll_interval_ms,
            "store has no change feed, polling for remote updates"
        );
    }
    let catalog = CareersCatalog::new(&settings.catalog).context("Failed to build catalog client")?;
    let upstream = UpstreamConfig::from(&settings.upstream);
    if upstream.api_key.is_none() {
        tracing::warn!("no upstream API key configured");
    }

    let sweeper = Sweeper::new(
        store,
        lease.clone(),
        Duration::from_secs(settings.store.cleanup_interval_seconds),
    );
    let relay = Relay::new(BridgeContext {
        instance_id,
        lease,
        broadcaster,
        catalog: Arc::new(catalog),
        upstream: Arc::new(upstream),
    });

    let shutdown_timeout = Duration::from_secs(settings.server.shutdown_timeout_secs);
    let server = JoblineServer::new(
        settings.server.clone(),
        relay,
        settings.client.clone(),
        telemetry.prometheus().cloned(),
    );
    let mut handles = server.spawn_background(Some(sweeper));
    let (addr, serve) = server.listen().await.context("Failed to bind listener")?;
    tracing::info!("jobline listening on http://{addr}");

    wait_for_signal().await?;

    tracing::info!("Shutting down...");
    server.drain(shutdown_timeout).await;
    handles.push(serve);
    server
        .shutdown()
        .graceful_shutdown(handles, shutdown_timeout)
        .await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["jobline"]);
        let mut settings = JoblineSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8765);
        assert_eq!(settings.store.url, "memory://");
    }

    #[test]
    fn cli_overrides_host_port_and_store() {
        let cli = Cli::parse_from([
            "jobline",
            "--host",
            "127.0.0.1",
            "--port",
            "0",
            "--store-url",
            "redis://cache:6379",
        ]);
        let mut settings = JoblineSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 0);
        assert_eq!(settings.store.url, "redis://cache:6379");
    }

    #[test]
    fn cli_config_path() {
        let cli = Cli::parse_from(["jobline", "--config", "/etc/jobline.json"]);
        assert_eq!(cli.config_path(), Some(PathBuf::from("/etc/jobline.json")));
    }

    #[test]
    fn cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["jobline", "--port", "99999"]).is_err());
    }

    #[test]
    fn telemetry_follows_logging_settings() {
        let mut settings = JoblineSettings::default();
        settings.logging.level = "debug".into();
        settings.logging.format = LogFormat::Compact;
        let config = telemetry_config(&settings);
        assert_eq!(config.filter, "debug");
        assert_eq!(config.format, jobline_telemetry::LogFormat::Compact);
        assert!(config.metrics_enabled);
    }
}
