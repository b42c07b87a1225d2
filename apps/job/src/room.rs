//! Per-room batch aggregation.
//!
//! Room pushes arrive one at a time but fan out to every gateway, so each
//! room gets a short-lived worker that frames incoming messages into one
//! buffer and flushes it — as a single Raw payload — when the batch fills or
//! the signal window elapses. Idle workers expire and are removed.

use std::sync::Arc;

use bytes::BytesMut;
use relay_protocol::Proto;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::job::Job;

/// One queued room message.
#[derive(Debug)]
pub struct RoomMsg {
    pub op: i32,
    pub body: Vec<u8>,
}

/// Queue capacity per room worker.
const ROOM_QUEUE: usize = 1024;

/// A worker exits after this many empty signal windows.
const MAX_IDLE: u32 = 10;

impl Job {
    /// Hand a room message to its aggregation worker, spawning one on first
    /// use (or after the previous worker expired).
    pub async fn room_push(self: &Arc<Self>, room_id: &str, op: i32, body: Vec<u8>) {
        let tx = self.room_sender(room_id);
        if tx.send(RoomMsg { op, body }).await.is_err() {
            tracing::warn!(%room_id, "room worker gone, message dropped");
        }
    }

    fn room_sender(self: &Arc<Self>, room_id: &str) -> mpsc::Sender<RoomMsg> {
        if let Some(tx) = self.rooms.get(room_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(ROOM_QUEUE);
        self.rooms.insert(room_id.to_string(), tx.clone());
        tokio::spawn(room_proc(self.clone(), room_id.to_string(), rx));
        tx
    }

    fn remove_room(&self, room_id: &str) {
        // Only reap the entry if it still points at the expired worker.
        self.rooms.remove_if(room_id, |_, tx| tx.is_closed());
    }
}

async fn room_proc(job: Arc<Job>, room_id: String, mut rx: mpsc::Receiver<RoomMsg>) {
    let batch = job.config.room_batch.max(1);
    let signal = job.config.room_signal;
    let mut buf = BytesMut::new();
    let mut n = 0usize;
    let mut idle = 0u32;
    // Flush deadline, armed when the first message of a batch arrives.
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let wait = match deadline {
            Some(d) => d.saturating_duration_since(tokio::time::Instant::now()),
            None => signal,
        };
        match timeout(wait, rx.recv()).await {
            Ok(Some(msg)) => {
                idle = 0;
                if let Err(e) = Proto::new(msg.op, msg.body).write_to(&mut buf) {
                    tracing::warn!(%room_id, error = %e, "unframeable room message");
                    continue;
                }
                n += 1;
                if n == 1 {
                    deadline = Some(tokio::time::Instant::now() + signal);
                }
                if n >= batch {
                    flush(&job, &room_id, &mut buf, &mut n).await;
                    deadline = None;
                }
            }
            Ok(None) => {
                flush(&job, &room_id, &mut buf, &mut n).await;
                break;
            }
            Err(_) => {
                if n > 0 {
                    flush(&job, &room_id, &mut buf, &mut n).await;
                    deadline = None;
                } else {
                    idle += 1;
                    if idle >= MAX_IDLE {
                        break;
                    }
                }
            }
        }
    }

    drop(rx);
    job.remove_room(&room_id);
    tracing::debug!(%room_id, "room worker expired");
}

async fn flush(job: &Arc<Job>, room_id: &str, buf: &mut BytesMut, n: &mut usize) {
    if *n == 0 {
        return;
    }
    let body = buf.split().to_vec();
    *n = 0;
    job.broadcast_room_raw(room_id, body).await;
}
