//! Local fan-out to browser sockets.

use std::collections::HashMap;
use std::sync::Arc;

use jobline_core::protocol::ServerMessage;
use jobline_core::{ConnectionId, SessionId};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::connection::ClientConnection;

/// The browser sockets attached to this instance.
#[derive(Debug, Default)]
pub struct ConnectionHub {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, connection: Arc<ClientConnection>) {
        let mut conns = self.connections.write().await;
        let _ = conns.insert(connection.id.clone(), connection);
    }

    /// Remove a connection. Returns how many sockets its session still has here.
    pub async fn remove(&self, connection_id: &ConnectionId) -> usize {
        let mut conns = self.connections.write().await;
        let Some(removed) = conns.remove(connection_id) else {
            return 0;
        };
        conns
            .values()
            .filter(|c| c.session_id == removed.session_id)
            .count()
    }

    /// Send `message` to every socket of `session`. Returns recipients reached.
    pub async fn send_to_session(&self, session_id: &SessionId, message: &ServerMessage) -> usize {
        match message.to_json() {
            Ok(json) => self.send_raw(session_id, Arc::from(json)).await,
            Err(e) => {
                warn!(%session_id, error = %e, "failed to serialize message");
                0
            }
        }
    }

    /// Send an already-encoded frame to every socket of `session`.
    pub async fn send_raw(&self, session_id: &SessionId, frame: Arc<str>) -> usize {
        let conns = self.connections.read().await;
        let mut delivered = 0;
        for conn in conns.values().filter(|c| &c.session_id == session_id) {
            if conn.send(frame.clone()) {
                delivered += 1;
            } else {
                debug!(conn_id = %conn.id, %session_id, "socket queue full, frame dropped");
            }
        }
        delivered
    }

    /// Ask every socket of `session` to close.
    pub async fn close_session(&self, session_id: &SessionId, code: u16, reason: &str) -> usize {
        let conns = self.connections.read().await;
        let mut closed = 0;
        for conn in conns.values().filter(|c| &c.session_id == session_id) {
            conn.close(code, reason);
            closed += 1;
        }
        closed
    }

    pub async fn close_all(&self, code: u16, reason: &str) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            conn.close(code, reason);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn session_count(&self, session_id: &SessionId) -> usize {
        let conns = self.connections.read().await;
        conns.values().filter(|c| &c.session_id == session_id).count()
    }

    /// Distinct sessions with at least one local socket.
    pub async fn sessions(&self) -> Vec<SessionId> {
        let conns = self.connections.read().await;
        let mut ids: Vec<SessionId> = conns.values().map(|c| c.session_id.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
