//! The per-session upstream bridge.
//!
//! A bridge runs only while this instance holds the session's ownership
//! lease. It owns the one upstream connection for the session, relays
//! browser audio up and assistant output down, executes tool calls, and
//! routes every resulting state change through [`StateBroadcaster::apply`].
//!
//! The bridge ends when it is cancelled, when the lease is lost, or when the
//! upstream cannot be (re)established. In the last two cases the session's
//! local sockets get a `connection_error` and are closed with 1013 so the
//! browsers reconnect and ownership is re-arbitrated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use jobline_core::protocol::{ErrorBody, ServerMessage};
use jobline_core::reconnect::CLOSE_TRY_AGAIN_LATER;
use jobline_core::retry::calculate_backoff_delay_with_random;
use jobline_core::session::Speaker;
use jobline_core::{InstanceId, Mutation, RelayError, SessionId};
use jobline_store::{run_renewal, OwnershipLease, RenewalOutcome, StoreError};
use jobline_telemetry::metrics::{UPSTREAM_BRIDGES_ACTIVE, UPSTREAM_RECONNECTS_TOTAL};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::StateBroadcaster;
use crate::catalog::JobCatalog;
use crate::errors::UpstreamError;
use crate::tools::{self, run_tool, ToolOutcome, TOOL_STATUS_SECS};
use crate::upstream::{
    self, strip_function_calls, Outbox, UpstreamConfig, UpstreamEvent, UpstreamSocket,
    RECONNECT_BASE_MS, RECONNECT_MAX_MS,
};

pub const LISTENING: &str = "Listening…";
pub const LISTENING_SECS: u64 = 10;

/// Queued audio appends kept while the upstream is slow.
const OUTBOX_AUDIO_CAPACITY: usize = 256;

/// Work handed to a running bridge.
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeCommand {
    /// Base64 audio to append to the input buffer.
    Audio(String),
    ClearAudio,
    /// A browser-supplied `session.update` body.
    SessionUpdate(Map<String, Value>),
    /// Context for the assistant's next turn after a manual action.
    SystemNote(String),
}

/// Everything a bridge needs from its instance.
#[derive(Clone)]
pub struct BridgeContext {
    pub instance_id: InstanceId,
    pub lease: OwnershipLease,
    pub broadcaster: Arc<StateBroadcaster>,
    pub catalog: Arc<dyn JobCatalog>,
    pub upstream: Arc<UpstreamConfig>,
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("instance_id", &self.instance_id)
            .field("upstream", &self.upstream.url)
            .finish_non_exhaustive()
    }
}

/// Why a bridge stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeExit {
    /// Cancelled locally (last socket left, or shutdown).
    Stopped,
    LeaseLost,
    UpstreamUnavailable(String),
    UpstreamDisconnected { attempts: u32 },
}

impl BridgeExit {
    /// The error browsers are told about, if any.
    pub fn error(&self, session_id: &SessionId) -> Option<RelayError> {
        match self {
            Self::Stopped => None,
            Self::LeaseLost => Some(RelayError::LeaseLost(session_id.clone())),
            Self::UpstreamUnavailable(reason) => Some(RelayError::UpstreamUnavailable(reason.clone())),
            Self::UpstreamDisconnected { attempts } => Some(RelayError::UpstreamDisconnected {
                attempts: *attempts,
            }),
        }
    }
}

/// Run the bridge for `session_id` until it exits. The caller must already
/// hold the lease; it is renewed here and released on exit unless it was lost.
#[instrument(skip_all, fields(session_id = %session_id, instance_id = %ctx.instance_id))]
pub async fn run_bridge(
    ctx: BridgeContext,
    session_id: SessionId,
    commands: mpsc::Receiver<BridgeCommand>,
    cancel: CancellationToken,
) -> BridgeExit {
    metrics::gauge!(UPSTREAM_BRIDGES_ACTIVE).increment(1.0);
    let renewal_cancel = cancel.child_token();
    let lost = CancellationToken::new();
    let mut renewal = tokio::spawn({
        let renewal = run_renewal(
            ctx.lease.clone(),
            session_id.clone(),
            ctx.instance_id.clone(),
            renewal_cancel.clone(),
        );
        let lost = lost.clone();
        async move {
            let outcome = renewal.await;
            if outcome == RenewalOutcome::Lost {
                lost.cancel();
            }
            outcome
        }
    });

    let mut bridge = Bridge::new(ctx.clone(), session_id.clone(), lost);
    let exit = match bridge.open(&cancel).await {
        Ok(socket) => bridge.pump(socket, commands, &mut renewal, &cancel).await,
        Err(exit) => exit,
    };
    renewal_cancel.cancel();

    finish(&ctx, &session_id, &exit).await;
    metrics::gauge!(UPSTREAM_BRIDGES_ACTIVE).decrement(1.0);
    exit
}

async fn finish(ctx: &BridgeContext, session_id: &SessionId, exit: &BridgeExit) {
    // Release first so a browser reconnecting to this instance can take over.
    if *exit != BridgeExit::LeaseLost {
        if let Err(e) = ctx.lease.release(session_id, &ctx.instance_id).await {
            warn!(error = %e, "lease release failed; it will lapse on its own");
        }
    }
    match exit.error(session_id) {
        Some(err) => {
            warn!(code = err.code(), error = %err, "upstream bridge failed");
            let hub = ctx.broadcaster.hub();
            let _ = hub
                .send_to_session(session_id, &ServerMessage::connection_error(&err))
                .await;
            let _ = hub
                .close_session(session_id, CLOSE_TRY_AGAIN_LATER, err.code())
                .await;
        }
        None => info!("upstream bridge stopped"),
    }
}

struct Bridge {
    ctx: BridgeContext,
    session_id: SessionId,
    outbox: Outbox,
    /// Last browser `session.update`, re-sent on reconnect.
    client_session: Option<Map<String, Value>>,
    /// call_id → tool name.
    pending_calls: HashMap<String, String>,
    tool_output_sent: bool,
    last_audio_response: Option<String>,
    /// Responses cut off by barge-in; their remaining audio is discarded.
    interrupted: HashSet<String>,
    /// Set the moment renewal reports the lease lost. From then on nothing
    /// reaches the browser or the session record.
    lost: CancellationToken,
}

impl Bridge {
    fn new(ctx: BridgeContext, session_id: SessionId, lost: CancellationToken) -> Self {
        Self {
            ctx,
            session_id,
            outbox: Outbox::new(OUTBOX_AUDIO_CAPACITY),
            client_session: None,
            pending_calls: HashMap::new(),
            tool_output_sent: false,
            last_audio_response: None,
            interrupted: HashSet::new(),
            lost,
        }
    }

    fn lease_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<UpstreamSocket, BridgeExit> {
        tokio::select! {
            () = cancel.cancelled() => Err(BridgeExit::Stopped),
            result = self.connect_configured() => result.map_err(|e| {
                warn!(error = %e, "upstream connect failed");
                BridgeExit::UpstreamUnavailable(e.to_string())
            }),
        }
    }

    async fn connect_configured(&self) -> Result<UpstreamSocket, UpstreamError> {
        let mut socket = upstream::connect(&self.ctx.upstream).await?;
        let update = self.ctx.upstream.session_update(self.client_session.as_ref());
        socket.send(Message::text(update.to_string())).await?;
        debug!("upstream connected and configured");
        Ok(socket)
    }

    async fn pump(
        &mut self,
        mut socket: UpstreamSocket,
        mut commands: mpsc::Receiver<BridgeCommand>,
        renewal: &mut JoinHandle<RenewalOutcome>,
        cancel: &CancellationToken,
    ) -> BridgeExit {
        info!("upstream bridge running");
        loop {
            let mut dropped = false;
            if let Err(e) = self.flush(&mut socket).await {
                warn!(error = %e, "upstream send failed");
                dropped = true;
            }

            if !dropped {
                dropped = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        let _ = socket.close(None).await;
                        return BridgeExit::Stopped;
                    }
                    outcome = &mut *renewal => {
                        let _ = socket.close(None).await;
                        return match outcome {
                            Ok(RenewalOutcome::Stopped) => BridgeExit::Stopped,
                            Ok(RenewalOutcome::Lost) | Err(_) => BridgeExit::LeaseLost,
                        };
                    }
                    cmd = commands.recv() => {
                        let Some(cmd) = cmd else {
                            let _ = socket.close(None).await;
                            return BridgeExit::Stopped;
                        };
                        self.enqueue(cmd);
                        // Take everything already waiting so a clear can
                        // cancel appends queued behind it.
                        while let Ok(cmd) = commands.try_recv() {
                            self.enqueue(cmd);
                        }
                        false
                    }
                    frame = socket.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if self.lease_lost() {
                                debug!("lease lost, dropping upstream frame");
                            } else {
                                self.on_upstream_text(text.as_str()).await;
                            }
                            false
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "upstream closed the connection");
                            true
                        }
                        Some(Ok(_)) => false,
                        Some(Err(e)) => {
                            warn!(error = %e, "upstream read failed");
                            true
                        }
                        None => true,
                    },
                };
            }

            if dropped {
                match self.reconnect(renewal, cancel).await {
                    Ok(fresh) => socket = fresh,
                    Err(exit) => return exit,
                }
            }
        }
    }

    async fn flush(&mut self, socket: &mut UpstreamSocket) -> Result<(), UpstreamError> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        while let Some(frame) = self.outbox.pop() {
            socket.feed(Message::text(frame)).await?;
        }
        socket.flush().await?;
        Ok(())
    }

    async fn reconnect(
        &mut self,
        renewal: &JoinHandle<RenewalOutcome>,
        cancel: &CancellationToken,
    ) -> Result<UpstreamSocket, BridgeExit> {
        // Nothing from the old upstream session carries over.
        self.outbox.clear();
        self.pending_calls.clear();
        self.tool_output_sent = false;
        self.last_audio_response = None;
        self.interrupted.clear();

        let max = self.ctx.upstream.max_reconnect_attempts;
        for attempt in 0..max {
            if renewal.is_finished() {
                return Err(BridgeExit::LeaseLost);
            }
            metrics::counter!(UPSTREAM_RECONNECTS_TOTAL).increment(1);
            let delay = calculate_backoff_delay_with_random(
                attempt,
                RECONNECT_BASE_MS,
                RECONNECT_MAX_MS,
                0.2,
                rand::random(),
            );
            tokio::select! {
                () = cancel.cancelled() => return Err(BridgeExit::Stopped),
                () = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
            let result = tokio::select! {
                () = cancel.cancelled() => return Err(BridgeExit::Stopped),
                result = self.connect_configured() => result,
            };
            match result {
                Ok(socket) => {
                    info!(attempt = attempt + 1, "upstream reconnected");
                    return Ok(socket);
                }
                Err(e) => warn!(attempt = attempt + 1, max, error = %e, "upstream reconnect failed"),
            }
        }
        Err(BridgeExit::UpstreamDisconnected { attempts: max })
    }

    fn enqueue(&mut self, cmd: BridgeCommand) {
        match cmd {
            BridgeCommand::Audio(audio) => self.outbox.push_audio(&audio),
            BridgeCommand::ClearAudio => {
                let discarded = self.outbox.clear_audio();
                if discarded > 0 {
                    debug!(discarded, "unsent audio discarded by clear");
                }
            }
            BridgeCommand::SessionUpdate(session) => {
                let update = self.ctx.upstream.session_update(Some(&session));
                self.client_session = Some(session);
                self.outbox.push_control(update.to_string());
            }
            BridgeCommand::SystemNote(text) => self.outbox.push_control(system_note(&text)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upstream events
    // ─────────────────────────────────────────────────────────────────────────

    async fn on_upstream_text(&mut self, text: &str) {
        let event = match UpstreamEvent::parse(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "undecodable upstream frame dropped");
                return;
            }
        };
        match event {
            UpstreamEvent::AudioDelta {
                response_id,
                item_id,
                delta,
            } => {
                if response_id
                    .as_ref()
                    .is_some_and(|id| self.interrupted.contains(id))
                {
                    return;
                }
                self.last_audio_response.clone_from(&response_id);
                self.to_browser(&ServerMessage::AudioDelta {
                    response_id,
                    item_id,
                    delta,
                })
                .await;
            }
            UpstreamEvent::TranscriptDelta {
                response_id,
                item_id,
                delta,
            } => {
                self.to_browser(&ServerMessage::TranscriptDelta {
                    response_id,
                    item_id,
                    delta,
                })
                .await;
            }
            UpstreamEvent::AssistantTranscriptDone { transcript } => {
                self.forward_raw(text).await;
                self.record_transcript(Speaker::Assistant, transcript).await;
            }
            UpstreamEvent::TranscriptionCompleted { item_id, transcript } => {
                self.to_browser(&ServerMessage::TranscriptionCompleted {
                    item_id,
                    transcript: transcript.clone(),
                })
                .await;
                self.record_transcript(Speaker::User, transcript).await;
            }
            UpstreamEvent::SpeechStarted { item_id } => {
                if let Some(id) = self.last_audio_response.take() {
                    debug!(response_id = %id, "barge-in, discarding remaining audio");
                    let _ = self.interrupted.insert(id);
                }
                self.to_browser(&ServerMessage::SpeechStarted { item_id }).await;
                self.apply(&Mutation::SetStatus {
                    text: LISTENING.into(),
                    duration_secs: LISTENING_SECS,
                })
                .await;
            }
            UpstreamEvent::FunctionCallCreated { call_id, name } => {
                debug!(%call_id, tool = %name, "tool call started");
                if let Some(text) = tools::status_text(&name) {
                    self.apply(&Mutation::SetStatus {
                        text: text.into(),
                        duration_secs: TOOL_STATUS_SECS,
                    })
                    .await;
                }
                let _ = self.pending_calls.insert(call_id, name);
            }
            UpstreamEvent::FunctionCallDone {
                call_id,
                name,
                arguments,
            } => {
                if self.pending_calls.remove(&call_id).is_none() {
                    debug!(%call_id, "tool call finished without a creation event");
                }
                self.run_tool_call(call_id, name, &arguments).await;
            }
            UpstreamEvent::ResponseDone { response } => {
                if self.tool_output_sent {
                    self.outbox
                        .push_control(json!({ "type": "response.create" }).to_string());
                    self.tool_output_sent = false;
                }
                if let Some(id) = response.get("id").and_then(Value::as_str) {
                    let _ = self.interrupted.remove(id);
                    if self.last_audio_response.as_deref() == Some(id) {
                        self.last_audio_response = None;
                    }
                }
                self.apply(&Mutation::ClearStatus {
                    only_if: Some(LISTENING.into()),
                })
                .await;
                self.to_browser(&ServerMessage::TurnComplete {
                    response: strip_function_calls(response),
                })
                .await;
            }
            UpstreamEvent::Error { error } => {
                warn!(%error, "upstream reported an error");
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error")
                    .to_owned();
                self.to_browser(&ServerMessage::Error {
                    error: ErrorBody {
                        code: "upstream_error".into(),
                        message,
                    },
                })
                .await;
            }
            UpstreamEvent::Internal => {}
            UpstreamEvent::Other => self.forward_raw(text).await,
        }
    }

    async fn run_tool_call(&mut self, call_id: String, name: String, arguments: &str) {
        let outcome = match self.ctx.broadcaster.store().get(&self.session_id).await {
            Ok(current) => {
                run_tool(self.ctx.catalog.as_ref(), &name, arguments, &current.session).await
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "session unreadable for tool call");
                ToolOutcome::error(format!("Session state unavailable: {e}"))
            }
        };
        // The catalog call can outlive the lease.
        if self.lease_lost() {
            debug!(tool = %name, "lease lost during tool call, result discarded");
            return;
        }

        self.outbox.push_control(
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": outcome.output,
                }
            })
            .to_string(),
        );
        self.tool_output_sent = true;

        self.to_browser(&ServerMessage::ToolResponse {
            tool_name: name.clone(),
            tool_result: outcome.output,
        })
        .await;
        if let Some(mutation) = &outcome.mutation {
            self.apply(mutation).await;
        }
        if let Some(text) = tools::status_text(&name) {
            self.apply(&Mutation::ClearStatus {
                only_if: Some(text.into()),
            })
            .await;
        }
    }

    async fn record_transcript(&self, role: Speaker, text: String) {
        if text.trim().is_empty() {
            return;
        }
        self.apply(&Mutation::AppendTranscript { role, text }).await;
    }

    /// Apply a mutation; failures are reported to the browser, never fatal.
    async fn apply(&self, mutation: &Mutation) {
        if self.lease_lost() {
            debug!(mutation = mutation.kind(), "lease lost, mutation skipped");
            return;
        }
        match self.ctx.broadcaster.apply(&self.session_id, mutation).await {
            Ok(_) => {}
            Err(StoreError::Conflict(_)) => {
                warn!(mutation = mutation.kind(), "mutation abandoned after repeated conflicts");
            }
            Err(e) => {
                warn!(mutation = mutation.kind(), error = %e, "session mutation failed");
                let err = RelayError::from(e);
                self.to_browser(&ServerMessage::error(&err)).await;
            }
        }
    }

    async fn to_browser(&self, message: &ServerMessage) {
        if self.lease_lost() {
            return;
        }
        let _ = self
            .ctx
            .broadcaster
            .hub()
            .send_to_session(&self.session_id, message)
            .await;
    }

    async fn forward_raw(&self, text: &str) {
        if self.lease_lost() {
            return;
        }
        let _ = self
            .ctx
            .broadcaster
            .hub()
            .send_raw(&self.session_id, Arc::from(text))
            .await;
    }
}

/// `conversation.item.create` carrying a system message.
pub fn system_note(text: &str) -> String {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "system",
            "content": [{ "type": "input_text", "text": text }]
        }
    })
    .to_string()
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted upstream and a wired-up bridge context for tests.

    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use jobline_core::{ConnectionId, InstanceId, SessionId};
    use jobline_settings::UpstreamSettings;
    use jobline_store::backend::{Backend, ChangeFeed, MemoryBackend};
    use jobline_store::{OwnershipLease, SessionStore};
    use serde_json::{json, Value};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    use super::BridgeContext;
    use crate::broadcast::StateBroadcaster;
    use crate::catalog::{JobCatalog, SearchPage};
    use crate::connection::ClientConnection;
    use crate::errors::CatalogError;
    use crate::hub::ConnectionHub;
    use crate::upstream::UpstreamConfig;

    pub const WAIT: Duration = Duration::from_secs(5);

    pub struct FakeCatalog;

    #[async_trait]
    impl JobCatalog for FakeCatalog {
        async fn search(&self, query: &str, country: Option<&str>) -> Result<SearchPage, CatalogError> {
            if query == "fail" {
                return Err(CatalogError::Status(502));
            }
            let jobs = vec![
                json!({"jobId": "101", "title": format!("{query} I")}),
                json!({"jobId": "102", "title": format!("{query} II")}),
            ];
            Ok(SearchPage {
                raw: json!({"operationResult": {"result": {"jobs": jobs.clone(), "totalJobs": 2}}, "country": country}),
                jobs,
                total: 2,
            })
        }

        async fn job_details(&self, job_id: &str) -> Result<Value, CatalogError> {
            Ok(json!({"jobId": job_id, "title": format!("Job {job_id}")}))
        }
    }

    /// Accepts upstream connections and hands each one to the test.
    pub struct FakeUpstream {
        pub url: String,
        accepted: mpsc::Receiver<WebSocketStream<TcpStream>>,
        task: JoinHandle<()>,
    }

    impl FakeUpstream {
        pub async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}/v1/realtime", listener.local_addr().unwrap());
            let (tx, accepted) = mpsc::channel(8);
            let task = tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    if let Ok(ws) = accept_async(stream).await {
                        if tx.send(ws).await.is_err() {
                            break;
                        }
                    }
                }
            });
            Self { url, accepted, task }
        }

        pub async fn accept(&mut self) -> WebSocketStream<TcpStream> {
            tokio::time::timeout(WAIT, self.accepted.recv())
                .await
                .expect("no upstream connection")
                .unwrap()
        }

        /// Stop accepting; later connects are refused.
        pub fn shutdown(&self) {
            self.task.abort();
        }
    }

    pub async fn recv_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            let msg = tokio::time::timeout(WAIT, ws.next())
                .await
                .expect("upstream read timed out")
                .expect("upstream stream ended")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Next upstream frame of type `kind`, skipping others.
    pub async fn recv_kind(ws: &mut WebSocketStream<TcpStream>, kind: &str) -> Value {
        loop {
            let v = recv_json(ws).await;
            if v["type"] == kind {
                return v;
            }
        }
    }

    pub async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: Value) {
        ws.send(Message::text(value.to_string())).await.unwrap();
    }

    pub struct Browser {
        pub conn: Arc<ClientConnection>,
        pub rx: mpsc::Receiver<Arc<str>>,
    }

    impl Browser {
        pub fn new(session: &SessionId, id: &str) -> Self {
            let (tx, rx) = mpsc::channel(256);
            Self {
                conn: Arc::new(ClientConnection::new(ConnectionId::from_raw(id), session.clone(), tx)),
                rx,
            }
        }

        pub async fn recv(&mut self) -> Value {
            let frame = tokio::time::timeout(WAIT, self.rx.recv())
                .await
                .expect("browser read timed out")
                .expect("browser queue closed");
            serde_json::from_str(&frame).unwrap()
        }

        /// Next frame of type `kind`, skipping others.
        pub async fn recv_kind(&mut self, kind: &str) -> Value {
            loop {
                let v = self.recv().await;
                if v["type"] == kind {
                    return v;
                }
            }
        }

        /// Every frame already queued.
        pub fn drain(&mut self) -> Vec<Value> {
            std::iter::from_fn(|| self.rx.try_recv().ok())
                .map(|f| serde_json::from_str(&f).unwrap())
                .collect()
        }
    }

    pub struct Harness {
        pub memory: Arc<MemoryBackend>,
        pub ctx: BridgeContext,
    }

    impl Harness {
        pub fn new(instance: &str, memory: Arc<MemoryBackend>, upstream_url: &str) -> Self {
            Self::with_lease(instance, memory, upstream_url, Duration::from_secs(15), Duration::from_secs(5))
        }

        pub fn with_lease(
            instance: &str,
            memory: Arc<MemoryBackend>,
            upstream_url: &str,
            ttl: Duration,
            renew: Duration,
        ) -> Self {
            let backend = Backend::from_memory(memory.clone());
            let op = Duration::from_secs(2);
            let store = SessionStore::new(&backend, Duration::from_secs(3600), op);
            let instance_id = InstanceId::from_raw(instance);
            let broadcaster = Arc::new(StateBroadcaster::new(
                instance_id.clone(),
                store,
                Some(memory.clone() as Arc<dyn ChangeFeed>),
                Arc::new(ConnectionHub::new()),
                Duration::from_millis(500),
            ));
            let mut upstream = UpstreamConfig::from(&UpstreamSettings::default());
            upstream.url = upstream_url.to_owned();
            upstream.connect_timeout = Duration::from_secs(2);
            upstream.max_reconnect_attempts = 1;
            let ctx = BridgeContext {
                instance_id,
                lease: OwnershipLease::new(&backend, ttl, renew, op),
                broadcaster,
                catalog: Arc::new(FakeCatalog),
                upstream: Arc::new(upstream),
            };
            Self { memory, ctx }
        }

        pub fn store(&self) -> &SessionStore {
            self.ctx.broadcaster.store()
        }

        pub async fn browser(&self, session: &SessionId, id: &str) -> Browser {
            let mut browser = Browser::new(session, id);
            let _ = self.ctx.broadcaster.attach(&browser.conn).await.unwrap();
            let _ = browser.recv_kind("state_update").await;
            browser
        }
    }
}
