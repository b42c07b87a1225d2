//! Framed TCP frontend.
//!
//! One accepted socket becomes two tasks: the reader parses length-prefixed
//! frames and dispatches them, the writer drains the channel's signal queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use relay_protocol::{ops, Proto, ProtoError, HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::bucket::Bucket;
use crate::channel::{Channel, Signal};
use crate::error::CometError;
use crate::server::Server;

pub async fn serve(server: Arc<Server>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let server = server.clone();
                tokio::spawn(async move {
                    serve_conn(server, stream, addr).await;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "tcp accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_conn(server: Arc<Server>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%addr, error = %e, "set_nodelay failed");
    }
    let (rd, wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    let mut wr = BufWriter::new(wr);
    let max_body = server.config().max_body_size;

    // First frame must be auth, within the handshake deadline.
    let first = match timeout(
        server.config().handshake_timeout,
        read_proto(&mut rd, max_body),
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
        .authenticate(&first, "", addr.ip().to_string())
        .await
    {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(%addr, error = %e, "auth failed");
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
    let mut buf = BytesMut::new();
    let wrote = write_proto(&mut wr, &mut buf, &reply).await;
    if wrote.is_err() || wr.flush().await.is_err() {
        server.disconnect(&bucket, &ch).await;
        return;
    }

    let writer = tokio::spawn(dispatch(ch.clone(), signal, wr));

    if let Err(e) = read_loop(&server, &bucket, &ch, &mut rd, deadline).await {
        tracing::debug!(key = %ch.key, error = %e, "reader exited");
    }
    server.disconnect(&bucket, &ch).await;
    let _ = writer.await;
}

/// Parse and dispatch frames until close, error, or missed heartbeat.
async fn read_loop(
    server: &Server,
    bucket: &Arc<Bucket>,
    ch: &Arc<Channel>,
    rd: &mut BufReader<OwnedReadHalf>,
    deadline: Duration,
) -> Result<(), CometError> {
    let max_body = server.config().max_body_size;
    let mut last_refresh = Instant::now();
    loop {
        tokio::select! {
            _ = ch.on_close() => return Ok(()),
            read = timeout(deadline, read_proto(rd, max_body)) => {
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

/// Writer task: block on the signal queue and write frames out.
async fn dispatch(
    ch: Arc<Channel>,
    mut signal: mpsc::Receiver<Signal>,
    mut wr: BufWriter<OwnedWriteHalf>,
) {
    if let Err(e) = dispatch_loop(&ch, &mut signal, &mut wr).await {
        tracing::debug!(key = %ch.key, error = %e, "writer exited");
        ch.close();
    }
    let _ = wr.shutdown().await;
}

async fn dispatch_loop(
    ch: &Arc<Channel>,
    signal: &mut mpsc::Receiver<Signal>,
    wr: &mut BufWriter<OwnedWriteHalf>,
) -> Result<(), CometError> {
    let mut buf = BytesMut::new();
    loop {
        tokio::select! {
            _ = ch.on_close() => return Ok(()),
            sig = signal.recv() => match sig {
                None => return Ok(()),
                Some(Signal::Ready) => {
                    while let Some(p) = ch.next_cli() {
                        write_proto(wr, &mut buf, &p).await?;
                    }
                    wr.flush().await?;
                }
                Some(Signal::Proto(p)) => {
                    if p.op == ops::OP_RAW {
                        // Pre-encoded by the producer: forward byte-for-byte.
                        wr.write_all(&p.body).await?;
                    } else {
                        write_proto(wr, &mut buf, &p).await?;
                    }
                    wr.flush().await?;
                }
            }
        }
    }
}

async fn read_proto<R: AsyncRead + Unpin>(
    rd: &mut R,
    max_body: usize,
) -> Result<Proto, CometError> {
    let mut head = [0u8; HEADER_SIZE];
    rd.read_exact(&mut head).await?;
    let pkg_len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
    if pkg_len < HEADER_SIZE || pkg_len > HEADER_SIZE + max_body {
        return Err(ProtoError::InvalidLength(pkg_len as u32).into());
    }
    let mut frame = vec![0u8; pkg_len];
    frame[..HEADER_SIZE].copy_from_slice(&head);
    rd.read_exact(&mut frame[HEADER_SIZE..]).await?;
    Ok(Proto::read_frame(&frame)?)
}

async fn write_proto<W: AsyncWrite + Unpin>(
    wr: &mut W,
    buf: &mut BytesMut,
    proto: &Proto,
) -> Result<(), CometError> {
    buf.clear();
    proto.write_to(buf)?;
    wr.write_all(buf).await?;
    Ok(())
}
