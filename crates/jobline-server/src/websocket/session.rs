//! One browser control socket, from upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use jobline_core::protocol::{ClientMessage, ServerMessage};
use jobline_core::reconnect::{CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_TRY_AGAIN_LATER};
use jobline_core::{ConnectionId, RelayError};
use jobline_relay::{ClientConnection, Relay};
use jobline_telemetry::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
    WS_MALFORMED_MESSAGES_TOTAL,
};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::heartbeat::{run_heartbeat, HeartbeatResult};

/// How long the writer may take to flush and close once asked to.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket tuning taken from server settings.
#[derive(Clone, Copy, Debug)]
pub struct SocketConfig {
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

/// Run a control socket.
///
/// 1. Resolves the session (`session.assigned` first when it was new)
/// 2. Attaches to the relay, which sends the current snapshot
/// 3. Routes inbound frames; malformed ones get an `error` reply
/// 4. Pings periodically and drops clients that stop answering
/// 5. Detaches on disconnect, stopping the bridge with the last socket
#[instrument(skip_all, fields(sid = requested.as_deref().unwrap_or("")))]
pub async fn run_ws_session(ws: WebSocket, relay: Arc<Relay>, config: SocketConfig, requested: Option<String>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (session_id, assigned) = match relay.open_session(requested.as_deref()).await {
        Ok(resolved) => resolved,
        Err(e) => {
            let err = RelayError::from(e);
            warn!(error = %err, "could not open session for socket");
            if let Ok(json) = ServerMessage::connection_error(&err).to_json() {
                let _ = ws_tx.send(Message::Text(json.into())).await;
            }
            let _ = ws_tx
                .send(close_message(CLOSE_TRY_AGAIN_LATER, "store unavailable"))
                .await;
            return;
        }
    };

    let (send_tx, send_rx) = mpsc::channel::<Arc<str>>(config.max_send_queue.max(1));
    let conn = Arc::new(ClientConnection::new(ConnectionId::new(), session_id.clone(), send_tx));
    info!(conn_id = %conn.id, session_id = %session_id, assigned, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    if assigned {
        let _ = conn.send_message(&ServerMessage::SessionAssigned {
            session_id: session_id.clone(),
        });
    }

    let writer = tokio::spawn(run_writer(ws_tx, send_rx, conn.clone(), config.heartbeat_interval));

    let heartbeat_cancel = tokio_util::sync::CancellationToken::new();
    let heartbeat = {
        let conn = conn.clone();
        let cancel = heartbeat_cancel.clone();
        tokio::spawn(async move {
            let result = run_heartbeat(conn.clone(), config.heartbeat_interval, config.heartbeat_timeout, cancel).await;
            if result == HeartbeatResult::TimedOut {
                warn!(conn_id = %conn.id, "client unresponsive, disconnecting");
                conn.close(CLOSE_GOING_AWAY, "heartbeat timeout");
            }
        })
    };

    match relay.attach(&conn).await {
        Ok(role) => debug!(conn_id = %conn.id, ?role, "socket attached"),
        Err(e) => {
            let err = RelayError::from(e);
            warn!(conn_id = %conn.id, error = %err, "attach failed");
            let _ = conn.send_message(&ServerMessage::connection_error(&err));
            conn.close(CLOSE_TRY_AGAIN_LATER, err.code());
        }
    }

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = conn.closed() => break,
        };
        let Some(Ok(frame)) = frame else { break };
        conn.mark_alive();
        match frame {
            Message::Text(text) => handle_text(&relay, &conn, text.as_str()).await,
            Message::Binary(_) => reject(&conn, &RelayError::MalformedMessage("binary frames are not accepted".into())),
            Message::Close(_) => {
                debug!(conn_id = %conn.id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    relay.detach(&conn).await;
    heartbeat_cancel.cancel();
    heartbeat.abort();
    conn.close(CLOSE_NORMAL, "");
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(conn_id = %conn.id, "writer did not finish in time");
    }

    info!(
        conn_id = %conn.id,
        session_id = %conn.session_id,
        dropped = conn.drop_count(),
        duration_secs = conn.connected_at.elapsed().as_secs(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
}

async fn handle_text(relay: &Relay, conn: &ClientConnection, text: &str) {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            reject(conn, &e);
            return;
        }
    };
    let kind = msg.kind();
    if let Err(e) = relay.handle_message(conn, msg).await {
        warn!(conn_id = %conn.id, kind, error = %e, "message failed");
        let _ = conn.send_message(&ServerMessage::error(&e));
    }
}

fn reject(conn: &ClientConnection, err: &RelayError) {
    warn!(conn_id = %conn.id, error = %err, "malformed frame dropped");
    counter!(WS_MALFORMED_MESSAGES_TOTAL).increment(1);
    let _ = conn.send_message(&ServerMessage::error(err));
}

/// Forward queued frames and pings until the connection is asked to close,
/// then flush what is queued and send the close frame.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<str>>,
    conn: Arc<ClientConnection>,
    ping_every: Duration,
) {
    let mut ping_interval = tokio::time::interval(ping_every);
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { return };
                if ws_tx.send(Message::Text(frame.as_ref().into())).await.is_err() {
                    return;
                }
            }
            () = conn.closed() => break,
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }

    while let Ok(frame) = rx.try_recv() {
        if ws_tx.feed(Message::Text(frame.as_ref().into())).await.is_err() {
            return;
        }
    }
    let request = conn.close_request();
    let (code, reason) = request
        .as_ref()
        .map_or((CLOSE_NORMAL, ""), |r| (r.code, r.reason.as_str()));
    let _ = ws_tx.send(close_message(code, reason)).await;
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
