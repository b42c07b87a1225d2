//! Job-facing RPC surface: targeted push, room broadcast, global broadcast.
//!
//! Protobuf over HTTP POST, mirroring the Logic RPC convention.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use prost::Message;
use relay_protocol::rpc::{
    BroadcastReply, BroadcastReq, BroadcastRoomReply, BroadcastRoomReq, PushMsgReply, PushMsgReq,
};
use relay_protocol::Proto;
use tower_http::trace::TraceLayer;

use crate::bucket::RoomPush;
use crate::logic::CONTENT_TYPE_PROTOBUF;
use crate::server::Server;

pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/rpc/push", post(push))
        .route("/rpc/broadcast", post(broadcast))
        .route("/rpc/broadcast-room", post(broadcast_room))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

fn reply<T: Message>(msg: T) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, CONTENT_TYPE_PROTOBUF)],
        msg.encode_to_vec(),
    )
}

fn decode<T: Message + Default>(body: Bytes) -> Result<T, StatusCode> {
    T::decode(body).map_err(|_| StatusCode::BAD_REQUEST)
}

/// Deliver a proto to a set of session keys on this gateway. Unknown keys and
/// full queues are drops, not errors.
async fn push(
    State(server): State<Arc<Server>>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: PushMsgReq = decode(body)?;
    let proto = req.proto.ok_or(StatusCode::BAD_REQUEST)?;
    for key in &req.keys {
        match server.bucket(key).channel(key) {
            Some(ch) if ch.need_push(req.proto_op) => {
                if let Err(e) = ch.push(proto.clone()) {
                    tracing::warn!(key = %key, error = %e, "push dropped");
                }
            }
            Some(_) => {}
            None => {
                tracing::debug!(key = %key, "push to unknown key");
            }
        }
    }
    Ok(reply(PushMsgReply {}))
}

/// Fan a proto out to every watching channel, paced bucket by bucket. The
/// sweep runs in the background so the caller is not held for its duration.
async fn broadcast(
    State(server): State<Arc<Server>>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: BroadcastReq = decode(body)?;
    let proto = req.proto.ok_or(StatusCode::BAD_REQUEST)?;
    tokio::spawn(async move {
        for bucket in server.buckets() {
            bucket.broadcast(&proto, req.proto_op);
            if req.speed > 0 {
                let pause = bucket.channel_count() as u64 / req.speed as u64;
                if pause > 0 {
                    tokio::time::sleep(Duration::from_secs(pause)).await;
                }
            }
        }
    });
    Ok(reply(BroadcastReply {}))
}

/// Queue a room push onto every bucket's worker lanes. Blocks when the lanes
/// are saturated — that is the broadcast backpressure point.
async fn broadcast_room(
    State(server): State<Arc<Server>>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: BroadcastRoomReq = decode(body)?;
    let proto: Proto = req.proto.ok_or(StatusCode::BAD_REQUEST)?;
    for bucket in server.buckets() {
        bucket
            .broadcast_room(RoomPush {
                room_id: req.room_id.clone(),
                proto: proto.clone(),
            })
            .await;
    }
    Ok(reply(BroadcastRoomReply {}))
}
