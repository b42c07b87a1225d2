//! Work-item dispatch: targeted pushes, room broadcasts, global broadcasts.
//!
//! Payloads are framed here, once, into the exact bytes the client will
//! receive, then wrapped as Raw so the gateway forwards them verbatim.
//! Transient RPC failures are retried a bounded number of times with linearly
//! increasing backoff; the final failure is logged and the message dropped.

use std::time::Duration;

use relay_protocol::push::{PushMsg, PushType};
use relay_protocol::rpc::{BroadcastReq, BroadcastRoomReq, PushMsgReq};
use relay_protocol::{ops, Proto, ProtoError};

use crate::comet::ClientError;
use crate::job::Job;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(10);

/// Frame the client-visible proto and wrap it for verbatim forwarding.
fn raw_proto(op: i32, body: Vec<u8>) -> Result<Proto, ProtoError> {
    let framed = Proto::new(op, body).to_frame()?;
    Ok(Proto::new(ops::OP_RAW, framed))
}

/// Call `op` up to `MAX_ATTEMPTS` times. Returns whether it ever succeeded.
async fn with_retry<F, Fut>(what: &str, server: &str, mut call: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), ClientError>>,
{
    for attempt in 1..=MAX_ATTEMPTS {
        match call().await {
            Ok(()) => return true,
            Err(e) if attempt == MAX_ATTEMPTS => {
                tracing::error!(%server, error = %e, "{what} failed after {MAX_ATTEMPTS} attempts, giving up");
            }
            Err(e) => {
                tracing::warn!(%server, error = %e, attempt, "{what} failed, retrying");
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
            }
        }
    }
    false
}

impl Job {
    /// Dispatch one consumed work item. Routing misses are drops, never
    /// errors — the consume still counts as successful.
    pub async fn dispatch(self: &std::sync::Arc<Self>, msg: PushMsg) {
        match PushType::try_from(msg.r#type) {
            Ok(PushType::Push) => {
                self.push_keys(msg.operation, &msg.server, msg.keys, msg.msg)
                    .await;
            }
            Ok(PushType::Room) => {
                self.room_push(&msg.room, msg.operation, msg.msg).await;
            }
            Ok(PushType::Broadcast) => {
                self.broadcast(msg.operation, msg.msg, msg.speed).await;
            }
            Err(_) => {
                tracing::warn!(msg_type = msg.r#type, "unknown push type");
            }
        }
    }

    /// Deliver to a batch of keys on one gateway.
    pub async fn push_keys(&self, op: i32, server: &str, keys: Vec<String>, body: Vec<u8>) {
        let proto = match raw_proto(op, body) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "unframeable push body");
                return;
            }
        };
        let Some(client) = self.comet(server) else {
            tracing::warn!(%server, "no comet for server");
            return;
        };
        let req = PushMsgReq {
            keys,
            proto_op: op,
            proto: Some(proto),
        };
        with_retry("push", server, || client.push(&req)).await;
    }

    /// Deliver to every gateway, splitting the global pacing rate between
    /// them.
    pub async fn broadcast(&self, op: i32, body: Vec<u8>, speed: i32) {
        let comets = self.comets();
        if comets.is_empty() {
            tracing::warn!("broadcast with no comets");
            return;
        }
        let proto = match raw_proto(op, body) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "unframeable broadcast body");
                return;
            }
        };
        let req = BroadcastReq {
            proto_op: op,
            proto: Some(proto),
            speed: speed / comets.len() as i32,
        };
        for client in comets {
            with_retry("broadcast", &client.hostname, || client.broadcast(&req)).await;
        }
    }

    /// Send an aggregated buffer of framed protos to a room on every gateway.
    /// Membership is local to each gateway; empty rooms no-op there.
    pub async fn broadcast_room_raw(&self, room_id: &str, raw_body: Vec<u8>) {
        let req = BroadcastRoomReq {
            room_id: room_id.to_string(),
            proto: Some(Proto::new(ops::OP_RAW, raw_body)),
        };
        for client in self.comets() {
            with_retry("broadcast room", &client.hostname, || {
                client.broadcast_room(&req)
            })
            .await;
        }
    }
}
