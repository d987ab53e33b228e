//! Browser socket state shared between the socket task and the relay.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobline_core::protocol::ServerMessage;
use jobline_core::{ConnectionId, SessionId};
use jobline_telemetry::metrics::BROADCAST_DROPS_TOTAL;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why the relay asked a socket to close.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

/// A connected browser socket bound to one session.
pub struct ClientConnection {
    pub id: ConnectionId,
    pub session_id: SessionId,
    /// Send channel to the socket's write task.
    tx: mpsc::Sender<Arc<str>>,
    pub connected_at: Instant,
    /// Whether the client has answered the last ping.
    pub is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    pub dropped_messages: AtomicU64,
    closing: CancellationToken,
    close_request: Mutex<Option<CloseRequest>>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    pub fn new(id: ConnectionId, session_id: SessionId, tx: mpsc::Sender<Arc<str>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            session_id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            closing: CancellationToken::new(),
            close_request: Mutex::new(None),
        }
    }

    /// Queue a text frame without waiting.
    ///
    /// Returns `false` if the queue is full or closed; the frame is dropped
    /// and counted.
    pub fn send(&self, frame: Arc<str>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(BROADCAST_DROPS_TOTAL).increment(1);
            false
        }
    }

    pub fn send_message(&self, message: &ServerMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.send(Arc::from(json)),
            Err(e) => {
                tracing::warn!(conn_id = %self.id, error = %e, "failed to serialize message");
                false
            }
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Pong (or any inbound frame) received.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Read and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Ask the socket task to close with `code` once queued frames are sent.
    /// The first request wins.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        {
            let mut slot = self.close_request.lock();
            if slot.is_none() {
                *slot = Some(CloseRequest {
                    code,
                    reason: reason.into(),
                });
            }
        }
        self.closing.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) was called.
    pub async fn closed(&self) {
        self.closing.cancelled().await;
    }

    pub fn close_request(&self) -> Option<CloseRequest> {
        self.close_request.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (ClientConnection, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = ClientConnection::new(
            ConnectionId::from_raw("conn_1"),
            SessionId::from_raw("sess_1"),
            tx,
        );
        (conn, rx)
    }

    #[tokio::test]
    async fn send_message_serializes() {
        let (conn, mut rx) = make_connection(4);
        assert!(conn.send_message(&ServerMessage::SpeechStarted { item_id: None }));
        let frame = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "input_audio_buffer.speech_started");
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send(Arc::from("a")));
        assert!(!conn.send(Arc::from("b")));
        assert!(!conn.send(Arc::from("c")));
        assert_eq!(conn.drop_count(), 2);
    }

    #[test]
    fn closed_channel_returns_false() {
        let (conn, rx) = make_connection(4);
        drop(rx);
        assert!(!conn.send(Arc::from("a")));
    }

    #[test]
    fn check_alive_resets_flag() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_elapsed_tracks_time() {
        let (conn, _rx) = make_connection(1);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(conn.last_pong_elapsed(), Duration::from_secs(40));
        conn.mark_alive();
        assert_eq!(conn.last_pong_elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn first_close_request_wins() {
        let (conn, _rx) = make_connection(1);
        assert!(!conn.is_closing());
        conn.close(1013, "upstream_disconnected");
        conn.close(1001, "shutdown");
        conn.closed().await;
        assert_eq!(
            conn.close_request(),
            Some(CloseRequest {
                code: 1013,
                reason: "upstream_disconnected".into()
            })
        );
    }
}
