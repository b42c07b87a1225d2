use relay_protocol::ProtoError;

use crate::logic::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum CometError {
    /// The channel's outbound queue is full; the message was dropped.
    #[error("signal full, message dropped")]
    SignalFull,
    /// The channel is closing; no further pushes are accepted.
    #[error("channel closed")]
    ChannelClosed,
    /// The inbound ring has no free slot; the reader is outpacing the writer.
    #[error("client proto ring full")]
    RingFull,
    /// The room reached zero members and no longer accepts puts.
    #[error("room dropped")]
    RoomDropped,
    #[error("first frame must be auth, got op {0}")]
    NotAuthed(i32),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("heartbeat deadline missed")]
    HeartbeatTimeout,
    #[error("protocol: {0}")]
    Proto(#[from] ProtoError),
    #[error("logic rpc: {0}")]
    Rpc(#[from] RpcError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] axum::Error),
}
