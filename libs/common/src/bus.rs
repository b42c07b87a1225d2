//! Partitioned durable bus between Logic (producer) and Job (consumer).
//!
//! Each partition is its own stream: one per gateway for targeted pushes, plus
//! the well-known `room` and `broadcast` partitions. Ordering holds within a
//! partition; consumption is at-least-once — a delivery stays pending until it
//! is acknowledged after dispatch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Notify;

/// Streams are capped so an absent consumer cannot grow them without bound.
const STREAM_MAXLEN: usize = 100_000;

/// How long a consumer poll blocks waiting for new entries.
const BLOCK_MS: usize = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus backend: {0}")]
    Backend(#[from] redis::RedisError),
}

/// One consumed work item. `id` is the backend's delivery tag.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub partition: String,
    pub id: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Append a payload to a partition.
    async fn publish(&self, partition: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

#[async_trait]
pub trait BusConsumer: Send {
    /// Pull up to `max` deliveries across the given partitions, blocking
    /// briefly when all of them are empty.
    async fn poll(&mut self, partitions: &[String], max: usize)
        -> Result<Vec<Delivery>, BusError>;

    /// Mark a delivery as dispatched.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// Redis Streams implementation
// ---------------------------------------------------------------------------

/// Producer half: `XADD {topic}:{partition}`.
#[derive(Clone)]
pub struct RedisBus {
    conn: ConnectionManager,
    topic: String,
}

impl RedisBus {
    pub async fn connect(url: &str, topic: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            topic: topic.to_string(),
        })
    }

    fn stream_key(&self, partition: &str) -> String {
        format!("{}:{}", self.topic, partition)
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, partition: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("XADD")
            .arg(self.stream_key(partition))
            .arg("MAXLEN")
            .arg("~")
            .arg(STREAM_MAXLEN)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Consumer half: `XREADGROUP` across the partition streams of interest.
pub struct RedisBusConsumer {
    conn: ConnectionManager,
    topic: String,
    group: String,
    consumer: String,
    /// Streams the consumer group has been created on.
    initialized: HashSet<String>,
}

impl RedisBusConsumer {
    pub async fn connect(
        url: &str,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            initialized: HashSet::new(),
        })
    }

    fn stream_key(&self, partition: &str) -> String {
        format!("{}:{}", self.topic, partition)
    }

    /// Create the consumer group on a stream if it does not exist yet.
    async fn ensure_group(&mut self, key: &str) -> Result<(), BusError> {
        if self.initialized.contains(key) {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {}
            // Another consumer got there first.
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }
        self.initialized.insert(key.to_string());
        Ok(())
    }
}

#[async_trait]
impl BusConsumer for RedisBusConsumer {
    async fn poll(
        &mut self,
        partitions: &[String],
        max: usize,
    ) -> Result<Vec<Delivery>, BusError> {
        if partitions.is_empty() {
            tokio::time::sleep(Duration::from_millis(BLOCK_MS as u64)).await;
            return Ok(Vec::new());
        }

        let keys: Vec<String> = partitions.iter().map(|p| self.stream_key(p)).collect();
        for key in &keys {
            self.ensure_group(key).await?;
        }

        let ids: Vec<&str> = keys.iter().map(|_| ">").collect();
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max)
            .block(BLOCK_MS);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn.xread_options(&keys, &ids, &opts).await?;

        let prefix_len = self.topic.len() + 1;
        let mut out = Vec::new();
        for stream in reply.keys {
            let partition = stream.key[prefix_len..].to_string();
            for entry in stream.ids {
                let payload = entry
                    .map
                    .get("payload")
                    .and_then(|v| redis::from_redis_value::<Vec<u8>>(v).ok())
                    .unwrap_or_default();
                out.push(Delivery {
                    partition: partition.clone(),
                    id: entry.id,
                    payload,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let key = self.stream_key(&delivery.partition);
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(key, &self.group, &[&delivery.id]).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryBusInner {
    partitions: HashMap<String, VecDeque<(u64, Vec<u8>)>>,
    next_id: u64,
}

/// Test bus: publishes land in per-partition queues; `poll` drains them in
/// order. Cloning shares the underlying queues, so a producer and a consumer
/// can be wired up in one process.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<MemoryBusInner>>,
    notify: Arc<Notify>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unconsumed payloads in a partition.
    pub fn len(&self, partition: &str) -> usize {
        self.inner
            .lock()
            .partitions
            .get(partition)
            .map_or(0, |q| q.len())
    }

    pub fn is_empty(&self, partition: &str) -> bool {
        self.len(partition) == 0
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, partition: &str, payload: Vec<u8>) -> Result<(), BusError> {
        {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .partitions
                .entry(partition.to_string())
                .or_default()
                .push_back((id, payload));
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl BusConsumer for MemoryBus {
    async fn poll(
        &mut self,
        partitions: &[String],
        max: usize,
    ) -> Result<Vec<Delivery>, BusError> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                let mut out = Vec::new();
                for partition in partitions {
                    let Some(queue) = inner.partitions.get_mut(partition) else {
                        continue;
                    };
                    while out.len() < max {
                        match queue.pop_front() {
                            Some((id, payload)) => out.push(Delivery {
                                partition: partition.clone(),
                                id: id.to_string(),
                                payload,
                            }),
                            None => break,
                        }
                    }
                }
                if !out.is_empty() {
                    return Ok(out);
                }
            }
            // Nothing buffered: wait for a publish, but never block forever so
            // partition-set changes are picked up.
            if tokio::time::timeout(Duration::from_millis(50), notified)
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&mut self, _delivery: &Delivery) -> Result<(), BusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_poll_preserves_partition_order() {
        let mut bus = MemoryBus::new();
        bus.publish("comet-1", b"a".to_vec()).await.unwrap();
        bus.publish("comet-1", b"b".to_vec()).await.unwrap();
        bus.publish("room", b"c".to_vec()).await.unwrap();

        let got = bus
            .poll(&["comet-1".to_string()], 16)
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].payload, b"a");
        assert_eq!(got[1].payload, b"b");
        assert_eq!(bus.len("room"), 1);
    }

    #[tokio::test]
    async fn poll_returns_empty_when_idle() {
        let mut bus = MemoryBus::new();
        let got = bus.poll(&["comet-1".to_string()], 16).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let bus = MemoryBus::new();
        let mut consumer = bus.clone();
        let handle = tokio::spawn(async move {
            consumer.poll(&["broadcast".to_string()], 1).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus.publish("broadcast", b"x".to_vec()).await.unwrap();
        let got = handle.await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"x");
    }
}
