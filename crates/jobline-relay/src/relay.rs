//! One instance's view of the relay: sessions, sockets and bridges.
//!
//! The HTTP layer talks only to [`Relay`]. Attaching a socket registers it
//! with the broadcaster and tries to take ownership of the session; while a
//! session has local sockets a watcher keeps its TTL fresh and retries
//! ownership each lease renewal interval, so an observer instance takes over
//! once the previous owner goes away.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jobline_core::protocol::ClientMessage;
use jobline_core::{InstanceId, RelayError, SessionId};
use jobline_store::{SessionStore, StoreError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeCommand, BridgeContext};
use crate::broadcast::StateBroadcaster;
use crate::connection::ClientConnection;
use crate::control::ManualControl;
use crate::hub::ConnectionHub;
use crate::registry::{BridgeRegistry, Role};

pub struct Relay {
    registry: Arc<BridgeRegistry>,
    /// Per-session keepalive and ownership retry, while sockets are attached.
    watchers: DashMap<SessionId, CancellationToken>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("instance_id", self.instance_id())
            .field("bridges", &self.registry)
            .field("watched", &self.watchers.len())
            .finish()
    }
}

impl Relay {
    pub fn new(ctx: BridgeContext) -> Arc<Self> {
        Arc::new(Self {
            registry: BridgeRegistry::new(ctx),
            watchers: DashMap::new(),
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.registry.context().instance_id
    }

    pub fn store(&self) -> &SessionStore {
        self.broadcaster().store()
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        self.broadcaster().hub()
    }

    pub fn broadcaster(&self) -> &Arc<StateBroadcaster> {
        &self.registry.context().broadcaster
    }

    pub fn bridges(&self) -> &Arc<BridgeRegistry> {
        &self.registry
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sessions and sockets
    // ─────────────────────────────────────────────────────────────────────────

    /// Resolve the session a socket asked for. A missing, malformed or
    /// unknown id yields a fresh session; the flag says whether it was
    /// newly assigned.
    pub async fn open_session(&self, requested: Option<&str>) -> Result<(SessionId, bool), StoreError> {
        if let Some(id) = requested.and_then(SessionId::parse_external) {
            if self.store().touch(&id).await? {
                return Ok((id, false));
            }
            debug!(session_id = %id, "requested session not found, assigning a new one");
        }
        let id = self.store().create().await?;
        Ok((id, true))
    }

    /// Register `conn`, send it the current snapshot and try to own its
    /// session. A failed ownership attempt leaves the socket an observer.
    pub async fn attach(self: &Arc<Self>, conn: &Arc<ClientConnection>) -> Result<Role, StoreError> {
        if let Err(e) = self.broadcaster().attach(conn).await {
            let _ = self.broadcaster().detach(conn).await;
            return Err(e);
        }
        let role = match self.registry.ensure(&conn.session_id).await {
            Ok(role) => role,
            Err(e) => {
                warn!(session_id = %conn.session_id, error = %e, "ownership check failed, observing");
                Role::Observer
            }
        };
        self.watch(&conn.session_id);
        debug!(session_id = %conn.session_id, conn_id = %conn.id, ?role, "socket attached");
        Ok(role)
    }

    /// Unregister `conn`. The last local socket of a session stops its
    /// bridge, which releases the lease.
    pub async fn detach(self: &Arc<Self>, conn: &ClientConnection) {
        let session = &conn.session_id;
        if self.broadcaster().detach(conn).await > 0 {
            return;
        }
        if let Some((_, token)) = self.watchers.remove(session) {
            token.cancel();
        }
        if self.registry.stop(session) {
            debug!(session_id = %session, "last socket left, bridge stopping");
        }
        // A socket may have attached while this one was leaving.
        if self.hub().session_count(session).await > 0 {
            self.watch(session);
        }
    }

    fn watch(self: &Arc<Self>, session: &SessionId) {
        let Entry::Vacant(slot) = self.watchers.entry(session.clone()) else {
            return;
        };
        let token = CancellationToken::new();
        let _ = slot.insert(token.clone());

        let relay = Arc::clone(self);
        let session = session.clone();
        let period = self.registry.context().lease.renew_interval();
        let _ = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => relay.watch_tick(&session).await,
                }
            }
        });
    }

    async fn watch_tick(self: &Arc<Self>, session: &SessionId) {
        match self.store().touch(session).await {
            Ok(true) => {}
            Ok(false) => debug!(session_id = %session, "watched session no longer exists"),
            Err(e) => debug!(session_id = %session, error = %e, "session touch failed"),
        }
        if self.registry.is_running(session) {
            return;
        }
        match self.registry.ensure(session).await {
            Ok(Role::Owner) => info!(session_id = %session, "took over session bridge"),
            Ok(Role::Observer) => {}
            Err(e) => debug!(session_id = %session, error = %e, "ownership retry failed"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Route one parsed browser message.
    ///
    /// Upstream-bound frames go to the local bridge and are dropped when this
    /// instance only observes the session. Manual controls apply on any
    /// instance.
    pub async fn handle_message(&self, conn: &ClientConnection, msg: ClientMessage) -> Result<(), RelayError> {
        let session = &conn.session_id;
        let command = match msg {
            ClientMessage::AudioAppend { audio } => BridgeCommand::Audio(audio),
            ClientMessage::AudioClear => BridgeCommand::ClearAudio,
            ClientMessage::SessionUpdate { session: body } => BridgeCommand::SessionUpdate(body),
            other => match ManualControl::from_message(other) {
                Some(control) => return self.apply_control(session, control).await,
                None => return Ok(()),
            },
        };
        if !self.registry.send(session, command) {
            debug!(session_id = %session, conn_id = %conn.id, "no local bridge, frame dropped");
        }
        Ok(())
    }

    async fn apply_control(&self, session: &SessionId, control: ManualControl) -> Result<(), RelayError> {
        let kind = control.kind();
        match control.apply(self.registry.context(), session).await {
            Ok(note) => {
                let seeded = self.registry.send(session, BridgeCommand::SystemNote(note));
                debug!(session_id = %session, control = kind, seeded, "manual control applied");
                Ok(())
            }
            Err(RelayError::VersionConflict(_)) => {
                warn!(session_id = %session, control = kind, "manual control lost to concurrent updates");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop watchers and bridges, waiting up to `timeout` for bridges to
    /// release their leases.
    pub async fn shutdown(&self, timeout: Duration) {
        self.watchers.retain(|_, token| {
            token.cancel();
            false
        });
        self.registry.shutdown(timeout).await;
    }
}
