//! A single client session: per-connection queues and the op-code filter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::{Mutex, RwLock};
use relay_protocol::Proto;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::CometError;
use crate::ring::Ring;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// What the writer task wakes up on.
#[derive(Debug)]
pub enum Signal {
    /// A server push to write out directly.
    Proto(Proto),
    /// Replies are waiting in the inbound ring.
    Ready,
}

/// One client session. Created on accept, owned by exactly one bucket until
/// disconnect or eviction.
pub struct Channel {
    pub id: u64,
    pub mid: i64,
    pub key: String,
    pub ip: String,
    /// Inbound requests, already transformed into their replies by the reader.
    cli_proto: Mutex<Ring>,
    signal: mpsc::Sender<Signal>,
    watch_ops: RwLock<AHashSet<i32>>,
    /// Mirror of bucket-side room membership; separate lock from `watch_ops`.
    rooms: RwLock<AHashSet<String>>,
    closed: CancellationToken,
    drops: AtomicU64,
}

impl Channel {
    /// Allocate a channel plus the receiving half of its signal queue, which
    /// the writer task takes ownership of.
    pub fn new(
        ring_size: usize,
        signal_buf: usize,
        mid: i64,
        key: String,
        ip: String,
    ) -> (Arc<Self>, mpsc::Receiver<Signal>) {
        let (tx, rx) = mpsc::channel(signal_buf.max(1));
        let ch = Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            mid,
            key,
            ip,
            cli_proto: Mutex::new(Ring::new(ring_size)),
            signal: tx,
            watch_ops: RwLock::new(AHashSet::new()),
            rooms: RwLock::new(AHashSet::new()),
            closed: CancellationToken::new(),
            drops: AtomicU64::new(0),
        });
        (ch, rx)
    }

    // -- watch filter -------------------------------------------------------

    pub fn watch(&self, ops: &[i32]) {
        let mut watch = self.watch_ops.write();
        for op in ops {
            watch.insert(*op);
        }
    }

    pub fn unwatch(&self, ops: &[i32]) {
        let mut watch = self.watch_ops.write();
        for op in ops {
            watch.remove(op);
        }
    }

    pub fn need_push(&self, op: i32) -> bool {
        self.watch_ops.read().contains(&op)
    }

    // -- room membership mirror ---------------------------------------------

    pub fn add_room(&self, room_id: &str) {
        self.rooms.write().insert(room_id.to_string());
    }

    pub fn remove_room(&self, room_id: &str) {
        self.rooms.write().remove(room_id);
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.rooms.read().contains(room_id)
    }

    /// Snapshot of the joined room ids.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms.read().iter().cloned().collect()
    }

    // -- outbound queue -----------------------------------------------------

    /// Non-blocking push. A slow reader never blocks fan-out: when the queue
    /// is full the message is dropped and the drop is reported to the caller.
    pub fn push(&self, proto: Proto) -> Result<(), CometError> {
        if self.is_closed() {
            return Err(CometError::ChannelClosed);
        }
        match self.signal.try_send(Signal::Proto(proto)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                Err(CometError::SignalFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CometError::ChannelClosed),
        }
    }

    /// Wake the writer to flush the inbound ring. Blocks when the signal
    /// queue is full — reply delivery must not be droppable.
    pub async fn signal_ready(&self) {
        let _ = self.signal.send(Signal::Ready).await;
    }

    /// Messages dropped on this channel because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    // -- inbound ring -------------------------------------------------------

    pub fn push_cli(&self, proto: Proto) -> Result<(), CometError> {
        self.cli_proto.lock().set(proto)
    }

    pub fn next_cli(&self) -> Option<Proto> {
        self.cli_proto.lock().get()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Signal the reader and writer tasks to tear the session down.
    /// Idempotent and non-blocking, so it is safe under a bucket lock.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closing.
    pub fn on_close(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::ops;

    fn channel(signal_buf: usize) -> (Arc<Channel>, mpsc::Receiver<Signal>) {
        Channel::new(8, signal_buf, 42, "key-1".into(), "127.0.0.1".into())
    }

    #[tokio::test]
    async fn push_drops_when_queue_is_full() {
        let cap = 4;
        let (ch, mut rx) = channel(cap);

        for i in 0..cap {
            ch.push(Proto::new(1000, vec![i as u8])).unwrap();
        }
        // Queue at capacity: the next push is dropped, not queued.
        let err = ch.push(Proto::new(1000, b"late".to_vec())).unwrap_err();
        assert!(matches!(err, CometError::SignalFull));
        assert_eq!(ch.dropped(), 1);

        // Exactly the first `cap` messages are delivered.
        for i in 0..cap {
            match rx.recv().await.unwrap() {
                Signal::Proto(p) => assert_eq!(p.body, vec![i as u8]),
                other => panic!("unexpected signal: {other:?}"),
            }
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn push_after_close_is_rejected() {
        let (ch, _rx) = channel(4);
        ch.close();
        assert!(matches!(
            ch.push(Proto::new(1000, Vec::new())),
            Err(CometError::ChannelClosed)
        ));
    }

    #[test]
    fn watch_filter_adds_and_removes() {
        let (ch, _rx) = channel(4);
        ch.watch(&[1000, 1001]);
        assert!(ch.need_push(1000));
        assert!(ch.need_push(1001));
        assert!(!ch.need_push(1002));

        ch.unwatch(&[1000]);
        assert!(!ch.need_push(1000));
        assert!(ch.need_push(1001));
    }

    #[test]
    fn room_mirror_tracks_membership() {
        let (ch, _rx) = channel(4);
        ch.add_room("chat://7");
        ch.add_room("chat://8");
        assert!(ch.has_room("chat://7"));

        let mut rooms = ch.rooms();
        rooms.sort();
        assert_eq!(rooms, vec!["chat://7".to_string(), "chat://8".to_string()]);

        ch.remove_room("chat://7");
        assert!(!ch.has_room("chat://7"));
    }

    #[test]
    fn close_is_idempotent() {
        let (ch, _rx) = channel(4);
        assert!(!ch.is_closed());
        ch.close();
        ch.close();
        assert!(ch.is_closed());
    }

    #[tokio::test]
    async fn ring_replies_flow_through_signal_ready() {
        let (ch, mut rx) = channel(4);
        let mut reply = Proto::new(ops::OP_HEARTBEAT_REPLY, Vec::new());
        reply.seq = 3;
        ch.push_cli(reply).unwrap();
        ch.signal_ready().await;

        assert!(matches!(rx.recv().await.unwrap(), Signal::Ready));
        assert_eq!(ch.next_cli().unwrap().seq, 3);
        assert!(ch.next_cli().is_none());
    }
}
