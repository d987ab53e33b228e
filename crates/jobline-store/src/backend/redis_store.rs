//! Redis backend.
//!
//! Keys:
//!
//! - `jobline:session:<id>`: hash `{v, body, touched}` with native TTL
//! - `jobline:active_sessions`: set of session ids
//! - `jobline:lease:<id>`: string holding the instance id, native TTL
//! - `jobline:state:<id>`: pub/sub channel for snapshots
//!
//! Multi-step transitions run as Lua scripts, so each is atomic on the server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use jobline_core::{InstanceId, SessionId};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};

use super::{ChangeFeed, FeedMessage, LeaseBackend, RecordBackend, StoredLease, StoredRecord};
use crate::errors::Result;

const KEY_PREFIX: &str = "jobline";
const ACTIVE_SESSIONS_KEY: &str = "jobline:active_sessions";
const STATE_CHANNEL_PATTERN: &str = "jobline:state:*";
const STATE_CHANNEL_PREFIX: &str = "jobline:state:";

fn session_key(id: &SessionId) -> String {
    format!("{KEY_PREFIX}:session:{id}")
}

fn lease_key(id: &SessionId) -> String {
    format!("{KEY_PREFIX}:lease:{id}")
}

fn state_channel(id: &SessionId) -> String {
    format!("{STATE_CHANNEL_PREFIX}{id}")
}

fn session_from_channel(channel: &str) -> Option<SessionId> {
    channel
        .strip_prefix(STATE_CHANNEL_PREFIX)
        .and_then(SessionId::parse_external)
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

const INSERT_NEW: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'v', 1, 'body', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
return 1
";

const COMPARE_AND_SWAP: &str = r"
local v = redis.call('HGET', KEYS[1], 'v')
if not v or tonumber(v) ~= tonumber(ARGV[1]) then return -1 end
local nv = tonumber(v) + 1
redis.call('HSET', KEYS[1], 'v', nv, 'body', ARGV[2])
redis.call('HDEL', KEYS[1], 'touched')
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return nv
";

const TOUCH: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], 'touched', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
";

const RENEW: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
";

const RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
";

pub struct RedisBackend {
    client: Client,
    conn: MultiplexedConnection,
    insert_new: Script,
    compare_and_swap: Script,
    touch: Script,
    renew: Script,
    release: Script,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::debug!("redis store connected");
        Ok(Self {
            client,
            conn,
            insert_new: Script::new(INSERT_NEW),
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            touch: Script::new(TOUCH),
            renew: Script::new(RENEW),
            release: Script::new(RELEASE),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl RecordBackend for RedisBackend {
    async fn load(&self, id: &SessionId) -> Result<Option<StoredRecord>> {
        let mut conn = self.conn();
        let (version, body, touched): (Option<u64>, Option<String>, Option<i64>) = redis::cmd("HMGET")
            .arg(session_key(id))
            .arg("v")
            .arg("body")
            .arg("touched")
            .query_async(&mut conn)
            .await?;
        Ok(match (version, body) {
            (Some(version), Some(body)) => Some(StoredRecord {
                version,
                body,
                touched_at_ms: touched,
            }),
            _ => None,
        })
    }

    async fn insert_new(&self, id: &SessionId, body: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let inserted: i64 = self
            .insert_new
            .key(session_key(id))
            .key(ACTIVE_SESSIONS_KEY)
            .arg(body)
            .arg(ttl_ms(ttl))
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn compare_and_swap(
        &self,
        id: &SessionId,
        expected: u64,
        body: &str,
        ttl: Duration,
    ) -> Result<Option<u64>> {
        let mut conn = self.conn();
        let version: i64 = self
            .compare_and_swap
            .key(session_key(id))
            .arg(expected)
            .arg(body)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(u64::try_from(version).ok())
    }

    async fn touch(&self, id: &SessionId, now_ms: i64, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let touched: i64 = self
            .touch
            .key(session_key(id))
            .arg(now_ms)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    async fn remove(&self, id: &SessionId) -> Result<()> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(session_key(id))
            .ignore()
            .cmd("SREM")
            .arg(ACTIVE_SESSIONS_KEY)
            .arg(id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn index_members(&self) -> Result<Vec<SessionId>> {
        let mut conn = self.conn();
        let mut ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(ACTIVE_SESSIONS_KEY)
            .query_async(&mut conn)
            .await?;
        ids.sort();
        Ok(ids.into_iter().map(SessionId::from_raw).collect())
    }

    async fn index_remove(&self, ids: &[SessionId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SREM");
        let _ = cmd.arg(ACTIVE_SESSIONS_KEY);
        for id in ids {
            let _ = cmd.arg(id.as_str());
        }
        let removed: usize = cmd.query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn purge_expired(&self) -> Result<usize> {
        // Keys expire natively.
        Ok(0)
    }
}

#[async_trait]
impl LeaseBackend for RedisBackend {
    async fn try_acquire(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let set: Option<String> = redis::cmd("SET")
            .arg(lease_key(session))
            .arg(holder.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn renew(&self, session: &SessionId, holder: &InstanceId, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let renewed: i64 = self
            .renew
            .key(lease_key(session))
            .arg(holder.as_str())
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn release(&self, session: &SessionId, holder: &InstanceId) -> Result<bool> {
        let mut conn = self.conn();
        let released: i64 = self
            .release
            .key(lease_key(session))
            .arg(holder.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn current(&self, session: &SessionId) -> Result<Option<StoredLease>> {
        let mut conn = self.conn();
        let (holder, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(lease_key(session))
            .cmd("PTTL")
            .arg(lease_key(session))
            .query_async(&mut conn)
            .await?;
        Ok(holder.filter(|_| pttl > 0).map(|holder| StoredLease {
            holder: InstanceId::from_raw(holder),
            expires_at: Utc::now() + chrono::Duration::milliseconds(pttl),
        }))
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

#[async_trait]
impl ChangeFeed for RedisBackend {
    async fn publish(&self, session: &SessionId, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(state_channel(session))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, FeedMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(STATE_CHANNEL_PATTERN).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let session_id = session_from_channel(msg.get_channel_name())?;
            match msg.get_payload::<String>() {
                Ok(payload) => Some(FeedMessage {
                    session_id,
                    payload,
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable feed payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
