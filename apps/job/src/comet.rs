//! RPC client for one Comet gateway.
//!
//! Lifecycle: created when discovery reports the hostname, reused while it
//! stays in the membership set, cancelled when it leaves. A cancelled client
//! rejects every call.

use std::time::Duration;

use prost::Message;
use relay_protocol::rpc::{
    BroadcastReply, BroadcastReq, BroadcastRoomReply, BroadcastRoomReq, PushMsgReply, PushMsgReq,
};
use tokio_util::sync::CancellationToken;

const CONTENT_TYPE_PROTOBUF: &str = "application/x-protobuf";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client cancelled")]
    Cancelled,
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("decode: {0}")]
    Decode(#[from] prost::DecodeError),
}

pub struct CometClient {
    pub hostname: String,
    base_url: String,
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl CometClient {
    pub fn new(hostname: &str, addr: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build comet http client");
        Self {
            hostname: hostname.to_string(),
            base_url: addr.trim_end_matches('/').to_string(),
            http,
            cancel: CancellationToken::new(),
        }
    }

    /// Fail all outstanding and future calls.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn call<Req: Message, Reply: Message + Default>(
        &self,
        path: &str,
        req: &Req,
    ) -> Result<Reply, ClientError> {
        if self.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let send = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_PROTOBUF)
            .body(req.encode_to_vec())
            .send();
        let resp = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            resp = send => resp?,
        };
        if !resp.status().is_success() {
            return Err(ClientError::Status(resp.status()));
        }
        let body = resp.bytes().await?;
        Ok(Reply::decode(body)?)
    }

    pub async fn push(&self, req: &PushMsgReq) -> Result<(), ClientError> {
        let _: PushMsgReply = self.call("/rpc/push", req).await?;
        Ok(())
    }

    pub async fn broadcast(&self, req: &BroadcastReq) -> Result<(), ClientError> {
        let _: BroadcastReply = self.call("/rpc/broadcast", req).await?;
        Ok(())
    }

    pub async fn broadcast_room(&self, req: &BroadcastRoomReq) -> Result<(), ClientError> {
        let _: BroadcastRoomReply = self.call("/rpc/broadcast-room", req).await?;
        Ok(())
    }
}
