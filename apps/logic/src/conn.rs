//! Session lifecycle ops: Connect, Disconnect, Heartbeat, RenewOnline,
//! Receive.

use std::collections::HashMap;
use std::sync::Arc;

use relay_common::{Bus, BusError};
use relay_protocol::rpc::ConnectReply;
use relay_protocol::Proto;
use serde::Deserialize;

use crate::config::Config;
use crate::store::{unix_now, MappingStore, OnlineSample, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LogicError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
    #[error("invalid connect token: {0}")]
    Token(#[from] serde_json::Error),
}

/// The connect token. Opaque bytes on the wire; these field semantics are
/// fixed regardless of encoding.
#[derive(Debug, Deserialize)]
struct ConnectToken {
    #[serde(default)]
    mid: i64,
    #[serde(default)]
    key: String,
    #[serde(default)]
    room_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    platform: String,
    #[serde(default)]
    accepts: Vec<i32>,
}

pub struct Logic {
    config: Arc<Config>,
    store: Arc<dyn MappingStore>,
    bus: Arc<dyn Bus>,
}

impl Logic {
    pub fn new(config: Arc<Config>, store: Arc<dyn MappingStore>, bus: Arc<dyn Bus>) -> Self {
        Self { config, store, bus }
    }

    pub(crate) fn bus(&self) -> &dyn Bus {
        self.bus.as_ref()
    }

    pub(crate) fn store(&self) -> &dyn MappingStore {
        self.store.as_ref()
    }

    /// Register a session: parse the token, mint a key when the client has
    /// none, and write the directory entries.
    pub async fn connect(
        &self,
        server: &str,
        _cookie: &str,
        token: &[u8],
    ) -> Result<ConnectReply, LogicError> {
        let token: ConnectToken = serde_json::from_slice(token)?;
        let key = if token.key.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            token.key
        };
        self.store
            .add_mapping(token.mid, &key, server, self.config.mapping_ttl())
            .await?;
        tracing::info!(mid = token.mid, %key, %server, "session connected");
        Ok(ConnectReply {
            mid: token.mid,
            key,
            room_id: token.room_id,
            accepts: token.accepts,
            heartbeat: self.config.mapping_ttl().as_secs() as i64,
        })
    }

    /// Remove the directory entry, unless a newer session on another gateway
    /// already owns the key. Returns whether anything was removed.
    pub async fn disconnect(
        &self,
        mid: i64,
        key: &str,
        server: &str,
    ) -> Result<bool, LogicError> {
        let has = self.store.del_mapping(mid, key, server).await?;
        tracing::info!(mid, %key, %server, has, "session disconnected");
        Ok(has)
    }

    /// Refresh the directory TTL, re-creating the entry if it expired.
    pub async fn heartbeat(&self, mid: i64, key: &str, server: &str) -> Result<(), LogicError> {
        let has = self
            .store
            .expire_mapping(mid, key, self.config.mapping_ttl())
            .await?;
        if !has {
            self.store
                .add_mapping(mid, key, server, self.config.mapping_ttl())
                .await?;
        }
        tracing::debug!(mid, %key, %server, "session heartbeat");
        Ok(())
    }

    /// Store a gateway's room counts and return the cross-gateway aggregate.
    pub async fn renew_online(
        &self,
        server: &str,
        room_count: HashMap<String, i32>,
    ) -> Result<HashMap<String, i32>, LogicError> {
        self.store
            .add_server_online(&OnlineSample {
                server: server.to_string(),
                room_count,
                updated: unix_now(),
            })
            .await?;
        self.aggregate_online().await
    }

    /// Sum room counts across all gateways with a fresh sample.
    async fn aggregate_online(&self) -> Result<HashMap<String, i32>, LogicError> {
        let horizon = unix_now() - self.config.mapping_ttl().as_secs() as i64;
        let mut merged: HashMap<String, i32> = HashMap::new();
        for sample in self.store.server_onlines().await? {
            if sample.updated < horizon {
                continue;
            }
            for (room, count) in sample.room_count {
                *merged.entry(room).or_insert(0) += count;
            }
        }
        Ok(merged)
    }

    /// Total online across all rooms and gateways.
    pub async fn online_total(&self) -> Result<i64, LogicError> {
        let merged = self.aggregate_online().await?;
        Ok(merged.values().map(|c| *c as i64).sum())
    }

    /// Producer-side handling of client messages is an external concern; the
    /// core only acknowledges them.
    pub async fn receive(&self, mid: i64, proto: &Proto) -> Result<(), LogicError> {
        tracing::info!(mid, op = proto.op, len = proto.body.len(), "message received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use relay_common::MemoryBus;
    use std::time::Duration;

    fn logic() -> Logic {
        logic_with_ttl(Duration::from_secs(60))
    }

    fn logic_with_ttl(ttl: Duration) -> Logic {
        let config = Arc::new(Config {
            http_bind: String::new(),
            rpc_bind: String::new(),
            redis_url: String::new(),
            bus_url: String::new(),
            bus_topic: "test".into(),
            heartbeat_interval: ttl,
            heartbeat_max: 1,
        });
        Logic::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBus::new()),
        )
    }

    #[tokio::test]
    async fn connect_writes_mapping_and_echoes_token() {
        let logic = logic();
        let reply = logic
            .connect(
                "comet-1",
                "",
                br#"{"mid":42,"key":"","room_id":"chat://7","platform":"web","accepts":[1000]}"#,
            )
            .await
            .unwrap();

        assert_eq!(reply.mid, 42);
        assert!(!reply.key.is_empty());
        assert_eq!(reply.room_id, "chat://7");
        assert_eq!(reply.accepts, vec![1000]);
        assert_eq!(reply.heartbeat, 60);

        let servers = logic
            .store()
            .servers_by_keys(&[reply.key.clone()])
            .await
            .unwrap();
        assert_eq!(servers[0].as_deref(), Some("comet-1"));
    }

    #[tokio::test]
    async fn connect_keeps_client_key() {
        let logic = logic();
        let reply = logic
            .connect("comet-1", "", br#"{"mid":1,"key":"sticky"}"#)
            .await
            .unwrap();
        assert_eq!(reply.key, "sticky");
    }

    #[tokio::test]
    async fn connect_rejects_garbage_token() {
        let logic = logic();
        let err = logic.connect("comet-1", "", b"not json").await.unwrap_err();
        assert!(matches!(err, LogicError::Token(_)));
    }

    #[tokio::test]
    async fn disconnect_then_repeat_reports_has() {
        let logic = logic();
        let reply = logic
            .connect("comet-1", "", br#"{"mid":42,"key":"K"}"#)
            .await
            .unwrap();

        assert!(logic.disconnect(42, &reply.key, "comet-1").await.unwrap());
        assert!(!logic.disconnect(42, &reply.key, "comet-1").await.unwrap());
    }

    #[tokio::test]
    async fn disconnect_from_wrong_server_is_ignored() {
        let logic = logic();
        logic
            .connect("comet-1", "", br#"{"mid":42,"key":"K"}"#)
            .await
            .unwrap();

        assert!(!logic.disconnect(42, "K", "comet-9").await.unwrap());
        let servers = logic.store().servers_by_keys(&["K".into()]).await.unwrap();
        assert_eq!(servers[0].as_deref(), Some("comet-1"));
    }

    #[tokio::test]
    async fn heartbeat_recreates_expired_mapping() {
        let logic = logic_with_ttl(Duration::from_millis(30));
        logic
            .connect("comet-1", "", br#"{"mid":42,"key":"K"}"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let servers = logic.store().servers_by_keys(&["K".into()]).await.unwrap();
        assert_eq!(servers[0], None);

        logic.heartbeat(42, "K", "comet-1").await.unwrap();
        let servers = logic.store().servers_by_keys(&["K".into()]).await.unwrap();
        assert_eq!(servers[0].as_deref(), Some("comet-1"));
    }

    #[tokio::test]
    async fn renew_online_aggregates_across_servers() {
        let logic = logic();
        logic
            .renew_online("comet-1", HashMap::from([("chat://7".to_string(), 2)]))
            .await
            .unwrap();
        let all = logic
            .renew_online(
                "comet-2",
                HashMap::from([("chat://7".to_string(), 3), ("chat://8".to_string(), 1)]),
            )
            .await
            .unwrap();

        assert_eq!(all.get("chat://7"), Some(&5));
        assert_eq!(all.get("chat://8"), Some(&1));
        assert_eq!(logic.online_total().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn stale_online_samples_are_excluded() {
        let logic = logic();
        logic
            .store()
            .add_server_online(&OnlineSample {
                server: "comet-dead".into(),
                room_count: HashMap::from([("chat://7".to_string(), 100)]),
                updated: unix_now() - 3600,
            })
            .await
            .unwrap();

        let all = logic
            .renew_online("comet-1", HashMap::from([("chat://7".to_string(), 2)]))
            .await
            .unwrap();
        assert_eq!(all.get("chat://7"), Some(&2));
    }
}
