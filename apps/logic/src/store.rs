//! The subscriber → gateway directory.
//!
//! Two logical maps: `key → server` (one per session) and `mid → {key →
//! server}` (a user may hold sessions on several devices). Every entry carries
//! the mapping TTL; an entry past its TTL is semantically absent. Backed by
//! Redis in production and an in-memory map in tests.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("malformed online sample: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One gateway's room-count report, timestamped for expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineSample {
    pub server: String,
    pub room_count: HashMap<String, i32>,
    /// Unix seconds when the sample was taken.
    pub updated: i64,
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Write both mappings with the given TTL.
    async fn add_mapping(
        &self,
        mid: i64,
        key: &str,
        server: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Refresh the TTLs. Returns whether the key mapping still existed.
    async fn expire_mapping(&self, mid: i64, key: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Remove the mapping — only if the key still maps to `server`, so a late
    /// disconnect never removes a newer session's entry on another gateway.
    /// Returns whether anything was removed.
    async fn del_mapping(&self, mid: i64, key: &str, server: &str) -> Result<bool, StoreError>;

    /// Resolve each key to its gateway, position-aligned with the input.
    async fn servers_by_keys(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Expand mids into their live `{key → server}` sessions.
    async fn keys_by_mids(&self, mids: &[i64]) -> Result<HashMap<String, String>, StoreError>;

    /// Store a gateway's room-count sample.
    async fn add_server_online(&self, sample: &OnlineSample) -> Result<(), StoreError>;

    /// All stored samples; callers filter by freshness.
    async fn server_onlines(&self) -> Result<Vec<OnlineSample>, StoreError>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

const ONLINE_KEY: &str = "online";

fn key_key(key: &str) -> String {
    format!("key_{key}")
}

fn mid_key(mid: i64) -> String {
    format!("mid_{mid}")
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl MappingStore for RedisStore {
    async fn add_mapping(
        &self,
        mid: i64,
        key: &str,
        server: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs();
        let _: () = conn.set_ex(key_key(key), server, ttl_secs).await?;
        if mid > 0 {
            let mkey = mid_key(mid);
            let _: () = conn.hset(&mkey, key, server).await?;
            let _: () = conn.expire(&mkey, ttl_secs as i64).await?;
        }
        Ok(())
    }

    async fn expire_mapping(
        &self,
        mid: i64,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs() as i64;
        let has: bool = conn.expire(key_key(key), ttl_secs).await?;
        if mid > 0 {
            let _: bool = conn.expire(mid_key(mid), ttl_secs).await?;
        }
        Ok(has)
    }

    async fn del_mapping(&self, mid: i64, key: &str, server: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let current: Option<String> = conn.get(key_key(key)).await?;
        if current.as_deref() != Some(server) {
            return Ok(false);
        }
        let _: () = conn.del(key_key(key)).await?;
        if mid > 0 {
            let _: () = conn.hdel(mid_key(mid), key).await?;
        }
        Ok(true)
    }

    async fn servers_by_keys(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let redis_keys: Vec<String> = keys.iter().map(|k| key_key(k)).collect();
        // MGET with a single key returns a scalar, so go through a pipeline
        // for a uniform reply shape.
        let mut pipe = redis::pipe();
        for k in &redis_keys {
            pipe.get(k);
        }
        let servers: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(servers)
    }

    async fn keys_by_mids(&self, mids: &[i64]) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut out = HashMap::new();
        for mid in mids {
            let sessions: HashMap<String, String> = conn.hgetall(mid_key(*mid)).await?;
            out.extend(sessions);
        }
        Ok(out)
    }

    async fn add_server_online(&self, sample: &OnlineSample) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(ONLINE_KEY, &sample.server, serde_json::to_string(sample)?)
            .await?;
        Ok(())
    }

    async fn server_onlines(&self) -> Result<Vec<OnlineSample>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(ONLINE_KEY).await?;
        let mut out = Vec::with_capacity(raw.len());
        for (server, json) in raw {
            match serde_json::from_str(&json) {
                Ok(sample) => out.push(sample),
                Err(e) => {
                    tracing::warn!(%server, error = %e, "dropping malformed online sample");
                }
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    /// key → (server, expiry)
    keys: HashMap<String, (String, Instant)>,
    /// mid → key → (server, expiry)
    mids: HashMap<i64, HashMap<String, (String, Instant)>>,
    onlines: HashMap<String, OnlineSample>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live<'a>(entry: Option<&'a (String, Instant)>) -> Option<&'a String> {
    match entry {
        Some((server, expires)) if *expires > Instant::now() => Some(server),
        _ => None,
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn add_mapping(
        &self,
        mid: i64,
        key: &str,
        server: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires = Instant::now() + ttl;
        let mut inner = self.inner.lock();
        inner
            .keys
            .insert(key.to_string(), (server.to_string(), expires));
        if mid > 0 {
            inner
                .mids
                .entry(mid)
                .or_default()
                .insert(key.to_string(), (server.to_string(), expires));
        }
        Ok(())
    }

    async fn expire_mapping(
        &self,
        mid: i64,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let expires = Instant::now() + ttl;
        let mut inner = self.inner.lock();
        let has = match inner.keys.get_mut(key) {
            Some(entry) if entry.1 > Instant::now() => {
                entry.1 = expires;
                true
            }
            _ => false,
        };
        if has && mid > 0 {
            if let Some(sessions) = inner.mids.get_mut(&mid) {
                if let Some(entry) = sessions.get_mut(key) {
                    entry.1 = expires;
                }
            }
        }
        Ok(has)
    }

    async fn del_mapping(&self, mid: i64, key: &str, server: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if live(inner.keys.get(key)).map(String::as_str) != Some(server) {
            return Ok(false);
        }
        inner.keys.remove(key);
        if mid > 0 {
            if let Some(sessions) = inner.mids.get_mut(&mid) {
                sessions.remove(key);
            }
        }
        Ok(true)
    }

    async fn servers_by_keys(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let inner = self.inner.lock();
        Ok(keys
            .iter()
            .map(|k| live(inner.keys.get(k)).cloned())
            .collect())
    }

    async fn keys_by_mids(&self, mids: &[i64]) -> Result<HashMap<String, String>, StoreError> {
        let inner = self.inner.lock();
        let mut out = HashMap::new();
        for mid in mids {
            if let Some(sessions) = inner.mids.get(mid) {
                for (key, entry) in sessions {
                    if entry.1 > Instant::now() {
                        out.insert(key.clone(), entry.0.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn add_server_online(&self, sample: &OnlineSample) -> Result<(), StoreError> {
        self.inner
            .lock()
            .onlines
            .insert(sample.server.clone(), sample.clone());
        Ok(())
    }

    async fn server_onlines(&self) -> Result<Vec<OnlineSample>, StoreError> {
        Ok(self.inner.lock().onlines.values().cloned().collect())
    }
}
