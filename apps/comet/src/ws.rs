//! WebSocket frontend: the same session protocol, one frame per binary
//! message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{ops, Proto, ProtoError, HEADER_SIZE};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tower_http::trace::TraceLayer;

use crate::bucket::Bucket;
use crate::channel::{Channel, Signal};
use crate::error::CometError;
use crate::server::Server;

pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/sub", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    ws.on_upgrade(move |socket| serve_conn(server, socket, addr, cookie))
}

async fn serve_conn(server: Arc<Server>, socket: WebSocket, addr: SocketAddr, cookie: String) {
    let (mut tx, mut rx) = socket.split();
    let max_body = server.config().max_body_size;

    let first = match timeout(
        server.config().handshake_timeout,
        next_proto(&mut rx, max_body),
    )
    .await
    {
        Ok(Ok(p)) => p,
        Ok(Err(e)) => {
            tracing::debug!(%addr, error = %e, "handshake read failed");
            return;
        }
        Err(_) => {
            tracing::debug!(%addr, "handshake timed out");
            return;
        }
    };

    let session = match server
        .authenticate(&first, &cookie, addr.ip().to_string())
        .await
    {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(%addr, error = %e, "auth failed");
            let _ = tx.send(Message::Close(None)).await;
            return;
        }
    };
    let crate::server::Session {
        ch,
        signal,
        bucket,
        deadline,
    } = session;

    let mut reply = Proto::new(ops::OP_AUTH_REPLY, Vec::new());
    reply.seq = first.seq;
    if send_proto(&mut tx, &reply).await.is_err() {
        server.disconnect(&bucket, &ch).await;
        return;
    }

    let writer = tokio::spawn(dispatch(ch.clone(), signal, tx));

    if let Err(e) = read_loop(&server, &bucket, &ch, &mut rx, deadline).await {
        tracing::debug!(key = %ch.key, error = %e, "reader exited");
    }
    server.disconnect(&bucket, &ch).await;
    let _ = writer.await;
}

async fn read_loop(
    server: &Server,
    bucket: &Arc<Bucket>,
    ch: &Arc<Channel>,
    rx: &mut SplitStream<WebSocket>,
    deadline: Duration,
) -> Result<(), CometError> {
    let max_body = server.config().max_body_size;
    let mut last_refresh = Instant::now();
    loop {
        tokio::select! {
            _ = ch.on_close() => return Ok(()),
            read = timeout(deadline, next_proto(rx, max_body)) => {
                let proto = match read {
                    Err(_) => return Err(CometError::HeartbeatTimeout),
                    Ok(Err(e)) => return Err(e),
                    Ok(Ok(p)) => p,
                };
                server.handle_proto(bucket, ch, proto, &mut last_refresh).await?;
            }
        }
    }
}

async fn dispatch(
    ch: Arc<Channel>,
    mut signal: mpsc::Receiver<Signal>,
    mut tx: SplitSink<WebSocket, Message>,
) {
    if let Err(e) = dispatch_loop(&ch, &mut signal, &mut tx).await {
        tracing::debug!(key = %ch.key, error = %e, "writer exited");
        ch.close();
    }
    let _ = tx.send(Message::Close(None)).await;
}

async fn dispatch_loop(
    ch: &Arc<Channel>,
    signal: &mut mpsc::Receiver<Signal>,
    tx: &mut SplitSink<WebSocket, Message>,
) -> Result<(), CometError> {
    loop {
        tokio::select! {
            _ = ch.on_close() => return Ok(()),
            sig = signal.recv() => match sig {
                None => return Ok(()),
                Some(Signal::Ready) => {
                    while let Some(p) = ch.next_cli() {
                        send_proto(tx, &p).await?;
                    }
                }
                Some(Signal::Proto(p)) => {
                    if p.op == ops::OP_RAW {
                        // Pre-encoded by the producer: one binary message,
                        // body verbatim.
                        tx.send(Message::Binary(p.body.into())).await?;
                    } else {
                        send_proto(tx, &p).await?;
                    }
                }
            }
        }
    }
}

/// Pull the next protocol frame, skipping control and text messages.
async fn next_proto(
    rx: &mut SplitStream<WebSocket>,
    max_body: usize,
) -> Result<Proto, CometError> {
    loop {
        match rx.next().await {
            None => return Err(closed()),
            Some(Err(e)) => return Err(CometError::WebSocket(e)),
            Some(Ok(Message::Binary(data))) => {
                if data.len() > HEADER_SIZE + max_body {
                    return Err(ProtoError::BodyTooLarge(data.len()).into());
                }
                return Ok(Proto::read_frame(&data)?);
            }
            Some(Ok(Message::Close(_))) => return Err(closed()),
            Some(Ok(_)) => continue,
        }
    }
}

async fn send_proto(
    tx: &mut SplitSink<WebSocket, Message>,
    proto: &Proto,
) -> Result<(), CometError> {
    let frame = proto.to_frame()?;
    tx.send(Message::Binary(frame.into())).await?;
    Ok(())
}

fn closed() -> CometError {
    CometError::Io(std::io::ErrorKind::UnexpectedEof.into())
}
