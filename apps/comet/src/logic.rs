//! RPC client for the Logic routing directory.
//!
//! Requests are protobuf over HTTP POST. Every call carries the configured
//! deadline — an RPC without one is a bug.

use std::collections::HashMap;
use std::time::Duration;

use prost::Message;
use relay_protocol::rpc::{
    ConnectReply, ConnectReq, DisconnectReply, DisconnectReq, HeartbeatReply, HeartbeatReq,
    ReceiveReply, ReceiveReq, RenewOnlineReply, RenewOnlineReq,
};
use relay_protocol::Proto;

pub const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("decode: {0}")]
    Decode(#[from] prost::DecodeError),
}

#[derive(Clone)]
pub struct LogicClient {
    http: reqwest::Client,
    base_url: String,
}

impl LogicClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build logic http client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn call<Req: Message, Reply: Message + Default>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Reply, RpcError> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_PROTOBUF)
            .body(req.encode_to_vec())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(RpcError::Status(resp.status()));
        }
        let body = resp.bytes().await?;
        Ok(Reply::decode(body)?)
    }

    /// Register a new session; the token is forwarded opaquely.
    pub async fn connect(
        &self,
        server: &str,
        cookie: &str,
        token: Vec<u8>,
    ) -> Result<ConnectReply, RpcError> {
        self.call(
            "/rpc/connect",
            &ConnectReq {
                server: server.to_string(),
                cookie: cookie.to_string(),
                token,
            },
        )
        .await
    }

    /// Drop the session mapping. Returns whether a mapping was removed.
    pub async fn disconnect(&self, mid: i64, key: &str, server: &str) -> Result<bool, RpcError> {
        let reply: DisconnectReply = self
            .call(
                "/rpc/disconnect",
                &DisconnectReq {
                    mid,
                    key: key.to_string(),
                    server: server.to_string(),
                },
            )
            .await?;
        Ok(reply.has)
    }

    /// Refresh the session mapping TTL.
    pub async fn heartbeat(&self, mid: i64, key: &str, server: &str) -> Result<(), RpcError> {
        let _: HeartbeatReply = self
            .call(
                "/rpc/heartbeat",
                &HeartbeatReq {
                    mid,
                    key: key.to_string(),
                    server: server.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Report local room counts; returns the cross-gateway aggregate.
    pub async fn renew_online(
        &self,
        server: &str,
        room_count: HashMap<String, i32>,
    ) -> Result<HashMap<String, i32>, RpcError> {
        let reply: RenewOnlineReply = self
            .call(
                "/rpc/renew-online",
                &RenewOnlineReq {
                    server: server.to_string(),
                    room_count,
                },
            )
            .await?;
        Ok(reply.all_room_count)
    }

    /// Forward a client-originated message for producer-side handling.
    pub async fn receive(&self, mid: i64, proto: &Proto) -> Result<(), RpcError> {
        let _: ReceiveReply = self
            .call(
                "/rpc/receive",
                &ReceiveReq {
                    mid,
                    proto: Some(proto.clone()),
                },
            )
            .await?;
        Ok(())
    }
}
