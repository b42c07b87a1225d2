//! Gateway instance registry.
//!
//! Comet instances register themselves under a stable app id and refresh their
//! lease periodically; Job polls the registry and reconciles its client table
//! from the returned snapshot. Entries whose lease has lapsed are invisible to
//! watchers.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry backend: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("malformed registry entry: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One registered gateway instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Stable gateway id (`server` in push work items).
    pub hostname: String,
    /// Base URL of the gateway's RPC listener.
    pub addr: String,
    /// Unix seconds of the last lease refresh.
    pub updated: i64,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Register or refresh an instance. The lease timestamp is stamped here.
    async fn register(&self, hostname: &str, addr: &str) -> Result<(), RegistryError>;

    /// Remove an instance immediately.
    async fn deregister(&self, hostname: &str) -> Result<(), RegistryError>;

    /// Snapshot of all instances with a live lease, keyed by hostname.
    async fn fetch(&self) -> Result<HashMap<String, Instance>, RegistryError>;
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Registry stored as a Redis hash `discovery:{app_id}` of
/// `hostname → Instance` entries. A lease is considered live for twice the
/// refresh interval, so one missed refresh does not flap membership.
#[derive(Clone)]
pub struct RedisRegistry {
    conn: ConnectionManager,
    key: String,
    lease: Duration,
}

impl RedisRegistry {
    pub async fn connect(
        url: &str,
        app_id: &str,
        lease: Duration,
    ) -> Result<Self, RegistryError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key: format!("discovery:{app_id}"),
            lease,
        })
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn register(&self, hostname: &str, addr: &str) -> Result<(), RegistryError> {
        let ins = Instance {
            hostname: hostname.to_string(),
            addr: addr.to_string(),
            updated: unix_now(),
        };
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(&self.key, hostname, serde_json::to_string(&ins)?)
            .await?;
        Ok(())
    }

    async fn deregister(&self, hostname: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(&self.key, hostname).await?;
        Ok(())
    }

    async fn fetch(&self) -> Result<HashMap<String, Instance>, RegistryError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(&self.key).await?;
        let horizon = unix_now() - 2 * self.lease.as_secs() as i64;
        let mut out = HashMap::with_capacity(raw.len());
        for (hostname, json) in raw {
            match serde_json::from_str::<Instance>(&json) {
                Ok(ins) if ins.updated >= horizon => {
                    out.insert(hostname, ins);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(%hostname, error = %e, "dropping malformed registry entry");
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
pub struct MemoryRegistry {
    instances: Mutex<HashMap<String, Instance>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, hostname: &str, addr: &str) -> Result<(), RegistryError> {
        self.instances.lock().insert(
            hostname.to_string(),
            Instance {
                hostname: hostname.to_string(),
                addr: addr.to_string(),
                updated: unix_now(),
            },
        );
        Ok(())
    }

    async fn deregister(&self, hostname: &str) -> Result<(), RegistryError> {
        self.instances.lock().remove(hostname);
        Ok(())
    }

    async fn fetch(&self) -> Result<HashMap<String, Instance>, RegistryError> {
        Ok(self.instances.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_fetch_deregister() {
        let registry = MemoryRegistry::new();
        registry
            .register("comet-1", "http://10.0.0.1:3109")
            .await
            .unwrap();
        registry
            .register("comet-2", "http://10.0.0.2:3109")
            .await
            .unwrap();

        let snapshot = registry.fetch().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["comet-1"].addr, "http://10.0.0.1:3109");

        registry.deregister("comet-1").await.unwrap();
        let snapshot = registry.fetch().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("comet-2"));
    }

    #[tokio::test]
    async fn re_register_refreshes_addr() {
        let registry = MemoryRegistry::new();
        registry.register("comet-1", "http://old:1").await.unwrap();
        registry.register("comet-1", "http://new:2").await.unwrap();
        let snapshot = registry.fetch().await.unwrap();
        assert_eq!(snapshot["comet-1"].addr, "http://new:2");
    }
}
