//! Comet-facing RPC endpoints: protobuf over HTTP POST.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use prost::Message;
use relay_protocol::rpc::{
    ConnectReq, DisconnectReply, DisconnectReq, HeartbeatReply, HeartbeatReq, ReceiveReply,
    ReceiveReq, RenewOnlineReply, RenewOnlineReq,
};

use crate::conn::LogicError;
use crate::AppState;

const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rpc/connect", post(connect))
        .route("/rpc/disconnect", post(disconnect))
        .route("/rpc/heartbeat", post(heartbeat))
        .route("/rpc/renew-online", post(renew_online))
        .route("/rpc/receive", post(receive))
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

fn status(err: LogicError) -> StatusCode {
    match err {
        LogicError::Token(e) => {
            tracing::debug!(error = %e, "invalid connect token");
            StatusCode::BAD_REQUEST
        }
        e => {
            tracing::error!(error = %e, "rpc failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn connect(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: ConnectReq = decode(body)?;
    let out = state
        .logic
        .connect(&req.server, &req.cookie, &req.token)
        .await
        .map_err(status)?;
    Ok(reply(out))
}

async fn disconnect(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: DisconnectReq = decode(body)?;
    let has = state
        .logic
        .disconnect(req.mid, &req.key, &req.server)
        .await
        .map_err(status)?;
    Ok(reply(DisconnectReply { has }))
}

async fn heartbeat(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: HeartbeatReq = decode(body)?;
    state
        .logic
        .heartbeat(req.mid, &req.key, &req.server)
        .await
        .map_err(status)?;
    Ok(reply(HeartbeatReply {}))
}

async fn renew_online(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: RenewOnlineReq = decode(body)?;
    let all_room_count = state
        .logic
        .renew_online(&req.server, req.room_count)
        .await
        .map_err(status)?;
    Ok(reply(RenewOnlineReply { all_room_count }))
}

async fn receive(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, StatusCode> {
    let req: ReceiveReq = decode(body)?;
    let proto = req.proto.unwrap_or_default();
    state
        .logic
        .receive(req.mid, &proto)
        .await
        .map_err(status)?;
    Ok(reply(ReceiveReply {}))
}
