//! Cross-instance state fan-out.
//!
//! Every visible mutation is delivered as a full snapshot: immediately to
//! this instance's sockets, and through the store's change feed to every
//! other instance. Without a feed each instance polls the store for the
//! sessions it has sockets for. A per-session version gate drops snapshots
//! no newer than the last one delivered here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use jobline_core::protocol::ServerMessage;
use jobline_core::retry::calculate_backoff_delay_with_random;
use jobline_core::{InstanceId, Mutation, SessionId, StateSnapshot, VersionedSession};
use jobline_store::backend::ChangeFeed;
use jobline_store::{FeedMessage, MutationOutcome, SessionStore, StoreError};
use jobline_telemetry::metrics::BROADCAST_SNAPSHOTS_TOTAL;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::hub::ConnectionHub;

const FEED_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// What travels on the change feed.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct FeedPayload {
    origin: InstanceId,
    snapshot: StateSnapshot,
}

pub struct StateBroadcaster {
    instance_id: InstanceId,
    store: SessionStore,
    feed: Option<Arc<dyn ChangeFeed>>,
    hub: Arc<ConnectionHub>,
    /// Last version delivered per locally observed session.
    delivered: Mutex<HashMap<SessionId, u64>>,
    poll_interval: Duration,
}

impl std::fmt::Debug for StateBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateBroadcaster")
            .field("instance_id", &self.instance_id)
            .field("has_feed", &self.feed.is_some())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl StateBroadcaster {
    pub fn new(
        instance_id: InstanceId,
        store: SessionStore,
        feed: Option<Arc<dyn ChangeFeed>>,
        hub: Arc<ConnectionHub>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            instance_id,
            store,
            feed,
            hub,
            delivered: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn uses_feed(&self) -> bool {
        self.feed.is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mutation and publication
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply `mutation` through the store and publish the result when it
    /// changed something observers can see.
    pub async fn apply(&self, session: &SessionId, mutation: &Mutation) -> Result<MutationOutcome, StoreError> {
        let outcome = self.store.mutate(session, mutation).await?;
        if outcome.changed && mutation.is_visible() {
            self.publish(&outcome.session).await;
        }
        Ok(outcome)
    }

    /// Deliver `versioned` here and announce it to other instances.
    pub async fn publish(&self, versioned: &VersionedSession) {
        let snapshot = versioned.snapshot(Utc::now());
        let local = self.deliver_local(&snapshot).await;
        metrics::counter!(BROADCAST_SNAPSHOTS_TOTAL, "source" => "local").increment(1);
        debug!(
            session_id = %snapshot.session_id,
            version = snapshot.version,
            local,
            "snapshot published"
        );

        let Some(feed) = &self.feed else {
            return;
        };
        let session_id = snapshot.session_id.clone();
        let payload = FeedPayload {
            origin: self.instance_id.clone(),
            snapshot,
        };
        let json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                warn!(%session_id, error = %e, "failed to encode feed payload");
                return;
            }
        };
        match tokio::time::timeout(FEED_PUBLISH_TIMEOUT, feed.publish(&session_id, &json)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%session_id, error = %e, "change feed publish failed"),
            Err(_) => warn!(%session_id, "change feed publish timed out"),
        }
    }

    /// Send `snapshot` to this instance's sockets unless an equal or newer
    /// version was already delivered. Returns sockets reached.
    pub async fn deliver_local(&self, snapshot: &StateSnapshot) -> usize {
        let mut delivered = self.delivered.lock().await;
        let last = delivered.entry(snapshot.session_id.clone()).or_insert(0);
        if snapshot.version <= *last {
            return 0;
        }
        *last = snapshot.version;
        let message = ServerMessage::state(snapshot.clone());
        // Sent under the gate lock so two deliveries cannot reorder.
        self.hub.send_to_session(&snapshot.session_id, &message).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register `conn` and send it the session's current snapshot.
    pub async fn attach(&self, conn: &Arc<ClientConnection>) -> Result<StateSnapshot, StoreError> {
        self.hub.add(conn.clone()).await;
        let snapshot = self.store.get(&conn.session_id).await?.snapshot(Utc::now());

        let mut delivered = self.delivered.lock().await;
        let last = delivered.entry(conn.session_id.clone()).or_insert(0);
        // A lower gate value means a newer snapshot already reached this
        // socket after it was registered.
        if snapshot.version >= *last {
            let _ = conn.send_message(&ServerMessage::state(snapshot.clone()));
            *last = snapshot.version;
        }
        Ok(snapshot)
    }

    /// Unregister `conn`. Returns how many sockets its session still has here.
    pub async fn detach(&self, conn: &ClientConnection) -> usize {
        let remaining = self.hub.remove(&conn.id).await;
        if remaining == 0 {
            let _ = self.delivered.lock().await.remove(&conn.session_id);
        }
        remaining
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Remote changes
    // ─────────────────────────────────────────────────────────────────────────

    /// Follow remote changes until cancelled: the change feed when the store
    /// has one, polling otherwise.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        match self.feed.clone() {
            Some(feed) => self.run_subscriber(feed, cancel).await,
            None => self.run_poller(cancel).await,
        }
    }

    async fn run_subscriber(&self, feed: Arc<dyn ChangeFeed>, cancel: CancellationToken) {
        info!(instance_id = %self.instance_id, "broadcaster following change feed");
        let mut attempt = 0u32;
        loop {
            let subscribed = tokio::select! {
                () = cancel.cancelled() => break,
                s = feed.subscribe() => s,
            };
            match subscribed {
                Ok(mut stream) => {
                    attempt = 0;
                    // Catch up on whatever was published while unsubscribed.
                    let _ = self.poll_once().await;
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            msg = stream.next() => match msg {
                                Some(msg) => self.on_feed_message(msg).await,
                                None => {
                                    warn!("change feed ended, resubscribing");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => warn!(error = %e, "change feed subscribe failed"),
            }
            let delay = calculate_backoff_delay_with_random(attempt, 250, 5_000, 0.2, rand::random());
            attempt = attempt.saturating_add(1);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
        info!("broadcaster stopped");
    }

    async fn on_feed_message(&self, msg: FeedMessage) {
        let payload: FeedPayload = match serde_json::from_str(&msg.payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(session_id = %msg.session_id, error = %e, "undecodable feed payload");
                return;
            }
        };
        if payload.origin == self.instance_id {
            return;
        }
        if self.hub.session_count(&payload.snapshot.session_id).await == 0 {
            return;
        }
        if self.deliver_local(&payload.snapshot).await > 0 {
            metrics::counter!(BROADCAST_SNAPSHOTS_TOTAL, "source" => "feed").increment(1);
        }
    }

    async fn run_poller(&self, cancel: CancellationToken) {
        info!(
            instance_id = %self.instance_id,
            interval_ms = self.poll_interval.as_millis() as u64,
            "broadcaster polling store"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let _ = self.poll_once().await;
        }
        info!("broadcaster stopped");
    }

    /// Read every locally observed session and deliver anything newer.
    pub async fn poll_once(&self) -> usize {
        let mut reached = 0;
        for session_id in self.hub.sessions().await {
            match self.store.get(&session_id).await {
                Ok(current) => {
                    let n = self.deliver_local(&current.snapshot(Utc::now())).await;
                    if n > 0 {
                        metrics::counter!(BROADCAST_SNAPSHOTS_TOTAL, "source" => "poll").increment(1);
                    }
                    reached += n;
                }
                Err(StoreError::NotFound(_)) => debug!(%session_id, "observed session no longer exists"),
                Err(e) => {
                    warn!(%session_id, error = %e, "snapshot poll failed");
                    break;
                }
            }
        }
        reached
    }
}
