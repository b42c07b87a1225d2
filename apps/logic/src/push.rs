//! Producer push ops: translate push RPCs into queued work items, partitioned
//! by the gateway that will dispatch them.

use std::collections::HashMap;

use prost::Message;
use relay_protocol::push::{PushMsg, PushType};

use crate::conn::{Logic, LogicError};

/// Room keys combine a namespace and a name, e.g. `chat://7`.
pub fn encode_room_key(typ: &str, room: &str) -> String {
    format!("{typ}://{room}")
}

impl Logic {
    /// Push a payload to a set of session keys. Keys are resolved to their
    /// gateways and bucketed so each gateway partition receives one work item.
    pub async fn push_keys(
        &self,
        op: i32,
        keys: &[String],
        msg: Vec<u8>,
    ) -> Result<(), LogicError> {
        let servers = self.store().servers_by_keys(keys).await?;
        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for (key, server) in keys.iter().zip(servers) {
            match server {
                Some(server) if !key.is_empty() => {
                    grouped.entry(server).or_default().push(key.clone());
                }
                _ => {
                    tracing::warn!(%key, "push key has no server");
                }
            }
        }
        for (server, server_keys) in grouped {
            self.publish(PushMsg {
                r#type: PushType::Push as i32,
                operation: op,
                speed: 0,
                server,
                room: String::new(),
                keys: server_keys,
                msg: msg.clone(),
            })
            .await?;
        }
        Ok(())
    }

    /// Push a payload to every live session of the given users.
    pub async fn push_mids(&self, op: i32, mids: &[i64], msg: Vec<u8>) -> Result<(), LogicError> {
        let sessions = self.store().keys_by_mids(mids).await?;
        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for (key, server) in sessions {
            if key.is_empty() || server.is_empty() {
                tracing::warn!(%key, %server, "push session is empty");
                continue;
            }
            grouped.entry(server).or_default().push(key);
        }
        for (server, server_keys) in grouped {
            self.publish(PushMsg {
                r#type: PushType::Push as i32,
                operation: op,
                speed: 0,
                server,
                room: String::new(),
                keys: server_keys,
                msg: msg.clone(),
            })
            .await?;
        }
        Ok(())
    }

    /// Push a payload to a room, cluster-wide.
    pub async fn push_room(
        &self,
        op: i32,
        typ: &str,
        room: &str,
        msg: Vec<u8>,
    ) -> Result<(), LogicError> {
        self.publish(PushMsg {
            r#type: PushType::Room as i32,
            operation: op,
            speed: 0,
            server: String::new(),
            room: encode_room_key(typ, room),
            keys: Vec::new(),
            msg,
        })
        .await
    }

    /// Push a payload to everyone, paced by the global `speed` hint.
    pub async fn push_all(&self, op: i32, speed: i32, msg: Vec<u8>) -> Result<(), LogicError> {
        self.publish(PushMsg {
            r#type: PushType::Broadcast as i32,
            operation: op,
            speed,
            server: String::new(),
            room: String::new(),
            keys: Vec::new(),
            msg,
        })
        .await
    }

    async fn publish(&self, msg: PushMsg) -> Result<(), LogicError> {
        let partition = msg.partition().to_string();
        self.bus().publish(&partition, msg.encode_to_vec()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;
    use relay_common::{BusConsumer, MemoryBus};
    use relay_protocol::push::{PARTITION_BROADCAST, PARTITION_ROOM};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        logic: Logic,
        bus: MemoryBus,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(Config {
            http_bind: String::new(),
            rpc_bind: String::new(),
            redis_url: String::new(),
            bus_url: String::new(),
            bus_topic: "test".into(),
            heartbeat_interval: Duration::from_secs(60),
            heartbeat_max: 1,
        });
        let bus = MemoryBus::new();
        Fixture {
            logic: Logic::new(
                config,
                Arc::new(MemoryStore::new()),
                Arc::new(bus.clone()),
            ),
            bus,
        }
    }

    async fn drain(bus: &MemoryBus, partition: &str) -> Vec<PushMsg> {
        let mut consumer = bus.clone();
        consumer
            .poll(&[partition.to_string()], 64)
            .await
            .unwrap()
            .into_iter()
            .map(|d| PushMsg::decode(d.payload.as_slice()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn push_keys_buckets_by_server() {
        let f = fixture();
        f.logic
            .connect("comet-1", "", br#"{"mid":1,"key":"a"}"#)
            .await
            .unwrap();
        f.logic
            .connect("comet-1", "", br#"{"mid":2,"key":"b"}"#)
            .await
            .unwrap();
        f.logic
            .connect("comet-2", "", br#"{"mid":3,"key":"c"}"#)
            .await
            .unwrap();

        f.logic
            .push_keys(
                1000,
                &["a".into(), "b".into(), "c".into(), "ghost".into()],
                b"hi".to_vec(),
            )
            .await
            .unwrap();

        let one = drain(&f.bus, "comet-1").await;
        assert_eq!(one.len(), 1);
        let mut keys = one[0].keys.clone();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(one[0].operation, 1000);
        assert_eq!(one[0].msg, b"hi");

        let two = drain(&f.bus, "comet-2").await;
        assert_eq!(two.len(), 1);
        assert_eq!(two[0].keys, vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn push_mids_expands_sessions() {
        let f = fixture();
        // One user, two devices on different gateways.
        f.logic
            .connect("comet-1", "", br#"{"mid":42,"key":"phone"}"#)
            .await
            .unwrap();
        f.logic
            .connect("comet-2", "", br#"{"mid":42,"key":"laptop"}"#)
            .await
            .unwrap();

        f.logic.push_mids(1000, &[42], b"hi".to_vec()).await.unwrap();

        let one = drain(&f.bus, "comet-1").await;
        assert_eq!(one[0].keys, vec!["phone".to_string()]);
        let two = drain(&f.bus, "comet-2").await;
        assert_eq!(two[0].keys, vec!["laptop".to_string()]);
    }

    #[tokio::test]
    async fn push_room_encodes_room_key() {
        let f = fixture();
        f.logic
            .push_room(1000, "chat", "7", b"hi".to_vec())
            .await
            .unwrap();

        let got = drain(&f.bus, PARTITION_ROOM).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].room, "chat://7");
        assert_eq!(got[0].r#type, PushType::Room as i32);
    }

    #[tokio::test]
    async fn push_all_carries_speed() {
        let f = fixture();
        f.logic.push_all(1000, 320, b"hi".to_vec()).await.unwrap();

        let got = drain(&f.bus, PARTITION_BROADCAST).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].speed, 320);
        assert_eq!(got[0].r#type, PushType::Broadcast as i32);
    }

    #[tokio::test]
    async fn push_keys_with_no_live_keys_publishes_nothing() {
        let f = fixture();
        f.logic
            .push_keys(1000, &["ghost".into()], b"hi".to_vec())
            .await
            .unwrap();
        assert!(f.bus.is_empty("comet-1"));
    }
}
