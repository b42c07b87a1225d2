//! Gateway core shared by the TCP and WebSocket frontends: bucket placement,
//! session handshake, per-frame dispatch, and the periodic room-count report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use relay_protocol::{ops, Proto};
use tokio::sync::mpsc;

use crate::bucket::Bucket;
use crate::channel::{Channel, Signal};
use crate::config::Config;
use crate::error::CometError;
use crate::logic::LogicClient;

/// An authenticated session, ready for its reader/writer task pair.
pub struct Session {
    pub ch: Arc<Channel>,
    /// Receiving half of the signal queue; owned by the writer task.
    pub signal: mpsc::Receiver<Signal>,
    pub bucket: Arc<Bucket>,
    /// Read deadline: the client must send something within it.
    pub deadline: Duration,
}

pub struct Server {
    config: Arc<Config>,
    buckets: Vec<Arc<Bucket>>,
    logic: LogicClient,
    hasher: RandomState,
}

impl Server {
    pub fn new(config: Arc<Config>, logic: LogicClient) -> Arc<Self> {
        let buckets = (0..config.bucket_count.max(1))
            .map(|_| Bucket::new(config.room_broadcast_workers, config.room_broadcast_queue))
            .collect();
        Arc::new(Self {
            config,
            buckets,
            logic,
            hasher: RandomState::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logic(&self) -> &LogicClient {
        &self.logic
    }

    /// The bucket responsible for a session key.
    pub fn bucket(&self, key: &str) -> &Arc<Bucket> {
        let idx = self.hasher.hash_one(key) as usize % self.buckets.len();
        &self.buckets[idx]
    }

    pub fn buckets(&self) -> &[Arc<Bucket>] {
        &self.buckets
    }

    /// Total connections across all buckets.
    pub fn channel_count(&self) -> usize {
        self.buckets.iter().map(|b| b.channel_count()).sum()
    }

    // -- session lifecycle --------------------------------------------------

    /// Authenticate the first client frame against Logic and place the new
    /// channel into its bucket.
    pub async fn authenticate(
        &self,
        proto: &Proto,
        cookie: &str,
        ip: String,
    ) -> Result<Session, CometError> {
        if proto.op != ops::OP_AUTH {
            return Err(CometError::NotAuthed(proto.op));
        }
        let reply = self
            .logic
            .connect(&self.config.server_id, cookie, proto.body.clone())
            .await?;

        let (ch, signal) = Channel::new(
            self.config.ring_size,
            self.config.channel_buf,
            reply.mid,
            reply.key.clone(),
            ip,
        );
        ch.watch(&reply.accepts);

        let bucket = self.bucket(&reply.key).clone();
        if let Err(e) = bucket.put(&reply.room_id, ch.clone()) {
            bucket.del(&ch);
            ch.close();
            return Err(e);
        }

        tracing::info!(
            mid = reply.mid,
            key = %reply.key,
            room = %reply.room_id,
            ip = %ch.ip,
            "session connected"
        );
        Ok(Session {
            ch,
            signal,
            bucket,
            deadline: Duration::from_secs(reply.heartbeat.max(1) as u64),
        })
    }

    /// Dispatch one post-handshake client frame. The frame is transformed
    /// into its reply in place, appended to the inbound ring, and the writer
    /// is signalled.
    pub async fn handle_proto(
        &self,
        bucket: &Arc<Bucket>,
        ch: &Arc<Channel>,
        mut proto: Proto,
        last_refresh: &mut Instant,
    ) -> Result<(), CometError> {
        match proto.op {
            ops::OP_HEARTBEAT => {
                proto.op = ops::OP_HEARTBEAT_REPLY;
                proto.body.clear();
                // Refresh the Logic mapping at most once per interval.
                if last_refresh.elapsed() >= self.config.heartbeat_interval {
                    *last_refresh = Instant::now();
                    if let Err(e) = self
                        .logic
                        .heartbeat(ch.mid, &ch.key, &self.config.server_id)
                        .await
                    {
                        tracing::warn!(key = %ch.key, error = %e, "heartbeat refresh failed");
                    }
                }
            }
            ops::OP_CHANGE_ROOM => {
                let room_id = String::from_utf8_lossy(&proto.body).trim().to_string();
                bucket.change_room(ch, &room_id)?;
                proto.op = ops::OP_CHANGE_ROOM_REPLY;
                proto.body.clear();
            }
            ops::OP_SUB => {
                let accepts: Vec<i32> = serde_json::from_slice(&proto.body).unwrap_or_default();
                ch.watch(&accepts);
                proto.op = ops::OP_SUB_REPLY;
                proto.body.clear();
            }
            ops::OP_UNSUB => {
                let accepts: Vec<i32> = serde_json::from_slice(&proto.body).unwrap_or_default();
                ch.unwatch(&accepts);
                proto.op = ops::OP_UNSUB_REPLY;
                proto.body.clear();
            }
            _ => {
                if let Err(e) = self.logic.receive(ch.mid, &proto).await {
                    tracing::warn!(mid = ch.mid, op = proto.op, error = %e, "receive failed");
                }
                proto.op = ops::OP_SEND_MSG_REPLY;
                proto.body.clear();
            }
        }
        ch.push_cli(proto)?;
        ch.signal_ready().await;
        Ok(())
    }

    /// Tear a session down: unregister locally, then best-effort Logic
    /// disconnect.
    pub async fn disconnect(&self, bucket: &Arc<Bucket>, ch: &Arc<Channel>) {
        bucket.del(ch);
        ch.close();
        match self
            .logic
            .disconnect(ch.mid, &ch.key, &self.config.server_id)
            .await
        {
            Ok(has) => {
                tracing::info!(mid = ch.mid, key = %ch.key, has, "session disconnected");
            }
            Err(e) => {
                tracing::warn!(key = %ch.key, error = %e, "logic disconnect failed");
            }
        }
    }

    // -- room-count reporting ----------------------------------------------

    /// Report local room counts to Logic and distribute the cross-gateway
    /// aggregate back to the rooms. Runs forever on the online tick.
    pub async fn renew_online_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.online_tick);
        tick.tick().await;
        loop {
            tick.tick().await;
            let mut merged = std::collections::HashMap::new();
            for bucket in &self.buckets {
                for (room_id, count) in bucket.rooms_count() {
                    *merged.entry(room_id).or_insert(0) += count;
                }
            }
            match self
                .logic
                .renew_online(&self.config.server_id, merged)
                .await
            {
                Ok(all) => {
                    for bucket in &self.buckets {
                        bucket.up_rooms_count(&all);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "renew online failed");
                }
            }
        }
    }
}
