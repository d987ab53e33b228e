//! `JoblineServer`: the axum HTTP + WebSocket surface of one instance.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use jobline_core::protocol::MAX_INBOUND_FRAME_BYTES;
use jobline_core::reconnect::CLOSE_GOING_AWAY;
use jobline_core::retry::ReconnectPolicy;
use jobline_core::SessionId;
use jobline_relay::Relay;
use jobline_settings::ServerSettings;
use jobline_store::{StoreError, Sweeper};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{run_ws_session, SocketConfig};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub reconnect: ReconnectPolicy,
    pub socket: SocketConfig,
    pub start_time: Instant,
    pub metrics: Option<PrometheusHandle>,
}

pub struct JoblineServer {
    settings: ServerSettings,
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
}

impl JoblineServer {
    pub fn new(
        settings: ServerSettings,
        relay: Arc<Relay>,
        reconnect: ReconnectPolicy,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let socket = SocketConfig {
            max_send_queue: settings.max_send_queue,
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(settings.heartbeat_timeout_secs.max(1)),
        };
        Self {
            settings,
            state: AppState {
                relay,
                reconnect,
                socket,
                start_time: Instant::now(),
                metrics,
            },
            shutdown: Arc::new(ShutdownCoordinator::new()),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/session", post(api::create_session))
            .route("/api/sessions", get(api::list_sessions))
            .route("/realtime", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.state.relay
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Start the instance's background loops (cross-instance fan-out and,
    /// when given, the sweeper). They stop with the shutdown token.
    pub fn spawn_background(&self, sweeper: Option<Sweeper>) -> Vec<JoinHandle<()>> {
        let token = self.shutdown.token();
        let mut handles = vec![tokio::spawn(
            self.state.relay.broadcaster().clone().run(token.clone()),
        )];
        if let Some(sweeper) = sweeper {
            handles.push(tokio::spawn(sweeper.run(token)));
        }
        handles
    }

    /// Bind and serve until shutdown. Returns the bound address and the
    /// serving task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "server stopped with error");
            }
        });
        info!(addr = %local_addr, instance_id = %self.state.relay.instance_id(), "listening");
        Ok((local_addr, handle))
    }

    /// Close every socket with 1001, stop bridges (releasing their leases)
    /// and cancel the shutdown token.
    pub async fn drain(&self, timeout: Duration) {
        let relay = &self.state.relay;
        relay.hub().close_all(CLOSE_GOING_AWAY, "server shutting down").await;
        relay.shutdown(timeout).await;
        self.shutdown.shutdown();
    }
}

#[derive(Debug, Deserialize)]
pub struct RealtimeQuery {
    pub sid: Option<String>,
}

/// GET /realtime?sid=<id>
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<RealtimeQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_INBOUND_FRAME_BYTES)
        .on_upgrade(move |socket| run_ws_session(socket, state.relay, state.socket, query.sid))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let relay = &state.relay;
    let probe = SessionId::from_raw("sess_health_probe");
    let store_ok = !matches!(
        relay.store().get(&probe).await,
        Err(StoreError::Unavailable(_))
    );
    let resp = health::health_check(
        state.start_time,
        relay.hub().connection_count().await,
        relay.bridges().running_count(),
        relay.instance_id().as_str(),
        store_ok,
    );
    let status = if resp.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use jobline_relay::bridge::BridgeContext;
    use jobline_relay::{ConnectionHub, JobCatalog, SearchPage, StateBroadcaster, UpstreamConfig};
    use jobline_settings::UpstreamSettings;
    use jobline_store::backend::{Backend, MemoryBackend};
    use jobline_store::{OwnershipLease, SessionStore};
    use tower::ServiceExt;

    struct NoCatalog;

    #[async_trait::async_trait]
    impl JobCatalog for NoCatalog {
        async fn search(
            &self,
            _query: &str,
            _country: Option<&str>,
        ) -> Result<SearchPage, jobline_relay::CatalogError> {
            Err(jobline_relay::CatalogError::Status(503))
        }

        async fn job_details(&self, _job_id: &str) -> Result<serde_json::Value, jobline_relay::CatalogError> {
            Err(jobline_relay::CatalogError::Status(503))
        }
    }

    fn make_server(memory: Arc<MemoryBackend>, metrics: Option<PrometheusHandle>) -> JoblineServer {
        let backend = Backend::from_memory(memory);
        let op = Duration::from_secs(1);
        let store = SessionStore::new(&backend, Duration::from_secs(3600), op);
        let instance_id = jobline_core::InstanceId::from_raw("inst_test");
        let broadcaster = Arc::new(StateBroadcaster::new(
            instance_id.clone(),
            store,
            backend.feed.clone(),
            Arc::new(ConnectionHub::new()),
            Duration::from_millis(500),
        ));
        let ctx = BridgeContext {
            instance_id,
            lease: OwnershipLease::new(&backend, Duration::from_secs(15), Duration::from_secs(5), op),
            broadcaster,
            catalog: Arc::new(NoCatalog),
            upstream: Arc::new(UpstreamConfig::from(&UpstreamSettings::default())),
        };
        let settings = ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
            ..ServerSettings::default()
        };
        JoblineServer::new(settings, Relay::new(ctx), ReconnectPolicy::default(), metrics)
    }

    async fn call(server: &JoblineServer, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn create_then_list_sessions() {
        let server = make_server(Arc::new(MemoryBackend::new()), None);
        let (status, created) = call(&server, "POST", "/api/session").await;
        assert_eq!(status, StatusCode::OK);
        let id = created["session_id"].as_str().unwrap().to_owned();
        assert!(id.starts_with("sess_"));
        assert_eq!(created["reconnect"]["initialDelayMs"], 1000);
        assert_eq!(created["reconnect"]["maxAttempts"], 8);

        let (status, listed) = call(&server, "GET", "/api/sessions").await;
        assert_eq!(status, StatusCode::OK);
        let sessions = listed["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"], id);
        assert_eq!(sessions[0]["view_mode"], "search");
    }

    #[tokio::test]
    async fn create_fails_with_503_when_store_down() {
        let memory = Arc::new(MemoryBackend::new());
        let server = make_server(memory.clone(), None);
        memory.set_available(false);
        let (status, body) = call(&server, "POST", "/api/session").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "store_unavailable");
    }

    #[tokio::test]
    async fn health_reports_store_state() {
        let memory = Arc::new(MemoryBackend::new());
        let server = make_server(memory.clone(), None);
        let (status, body) = call(&server, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["instance_id"], "inst_test");
        assert_eq!(body["connections"], 0);

        memory.set_available(false);
        let (status, body) = call(&server, "GET", "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["store"], "unavailable");
    }

    #[tokio::test]
    async fn metrics_404_without_recorder() {
        let server = make_server(Arc::new(MemoryBackend::new()), None);
        let (status, _) = call(&server, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_render_with_recorder() {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        let server = make_server(Arc::new(MemoryBackend::new()), Some(handle));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server(Arc::new(MemoryBackend::new()), None);
        let (status, _) = call(&server, "GET", "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn drain_cancels_token() {
        let server = make_server(Arc::new(MemoryBackend::new()), None);
        let token = server.shutdown().token();
        server.drain(Duration::from_secs(1)).await;
        assert!(token.is_cancelled());
    }
}
