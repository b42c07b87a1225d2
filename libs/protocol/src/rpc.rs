//! Request/reply messages for inter-service RPC.
//!
//! Carried as protobuf over HTTP POST (`application/x-protobuf`). Comet calls
//! Logic with the session ops; Job calls Comet with the push ops.

use std::collections::HashMap;

use crate::proto::Proto;

// ---------------------------------------------------------------------------
// Comet → Logic
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectReq {
    #[prost(string, tag = "1")]
    pub server: String,
    #[prost(string, tag = "2")]
    pub cookie: String,
    /// Opaque connect token, forwarded from the client's auth frame.
    #[prost(bytes = "vec", tag = "3")]
    pub token: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectReply {
    #[prost(int64, tag = "1")]
    pub mid: i64,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(string, tag = "3")]
    pub room_id: String,
    #[prost(int32, repeated, tag = "4")]
    pub accepts: Vec<i32>,
    /// Session deadline in seconds; the client must heartbeat within it.
    #[prost(int64, tag = "5")]
    pub heartbeat: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisconnectReq {
    #[prost(int64, tag = "1")]
    pub mid: i64,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(string, tag = "3")]
    pub server: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisconnectReply {
    #[prost(bool, tag = "1")]
    pub has: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatReq {
    #[prost(int64, tag = "1")]
    pub mid: i64,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(string, tag = "3")]
    pub server: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatReply {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RenewOnlineReq {
    #[prost(string, tag = "1")]
    pub server: String,
    /// Local member count per room on this gateway.
    #[prost(map = "string, int32", tag = "2")]
    pub room_count: HashMap<String, i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RenewOnlineReply {
    /// Cross-gateway aggregate per room.
    #[prost(map = "string, int32", tag = "1")]
    pub all_room_count: HashMap<String, i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReceiveReq {
    #[prost(int64, tag = "1")]
    pub mid: i64,
    #[prost(message, optional, tag = "2")]
    pub proto: Option<Proto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReceiveReply {}

// ---------------------------------------------------------------------------
// Job → Comet
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushMsgReq {
    #[prost(string, repeated, tag = "1")]
    pub keys: Vec<String>,
    /// Operation used against each channel's watch filter.
    #[prost(int32, tag = "2")]
    pub proto_op: i32,
    #[prost(message, optional, tag = "3")]
    pub proto: Option<Proto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushMsgReply {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BroadcastReq {
    #[prost(int32, tag = "1")]
    pub proto_op: i32,
    #[prost(message, optional, tag = "2")]
    pub proto: Option<Proto>,
    /// Per-gateway pacing rate, messages per second. 0 disables pacing.
    #[prost(int32, tag = "3")]
    pub speed: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BroadcastReply {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BroadcastRoomReq {
    #[prost(string, tag = "1")]
    pub room_id: String,
    #[prost(message, optional, tag = "2")]
    pub proto: Option<Proto>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BroadcastRoomReply {}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn connect_reply_round_trips() {
        let reply = ConnectReply {
            mid: 42,
            key: "uuid-1".into(),
            room_id: "chat://7".into(),
            accepts: vec![1000, 1001],
            heartbeat: 300,
        };
        let back = ConnectReply::decode(reply.encode_to_vec().as_slice()).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn embedded_proto_round_trips() {
        let req = PushMsgReq {
            keys: vec!["k".into()],
            proto_op: 1000,
            proto: Some(Proto::new(crate::ops::OP_RAW, b"payload".to_vec())),
        };
        let back = PushMsgReq::decode(req.encode_to_vec().as_slice()).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn renew_online_map_round_trips() {
        let mut room_count = HashMap::new();
        room_count.insert("chat://7".to_string(), 3);
        let req = RenewOnlineReq {
            server: "comet-1".into(),
            room_count,
        };
        let back = RenewOnlineReq::decode(req.encode_to_vec().as_slice()).unwrap();
        assert_eq!(back, req);
    }
}
