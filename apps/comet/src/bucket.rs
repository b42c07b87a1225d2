//! A shard of the gateway's connection registry.
//!
//! Buckets cap lock contention: every channel lives in exactly one bucket
//! (picked by key hash), and all lookup/mutation inside a bucket is serialized
//! by one RwLock. Room broadcasts are decoupled from callers through a fixed
//! set of pre-spawned worker lanes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::RwLock;
use relay_protocol::Proto;
use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::error::CometError;
use crate::room::Room;

/// A room push routed through a bucket's worker lanes.
#[derive(Debug, Clone)]
pub struct RoomPush {
    pub room_id: String,
    pub proto: Proto,
}

struct BucketInner {
    chs: HashMap<String, Arc<Channel>, RandomState>,
    rooms: HashMap<String, Arc<Room>, RandomState>,
    ip_cnts: HashMap<String, i32, RandomState>,
}

impl BucketInner {
    fn inc_ip(&mut self, ip: &str) {
        *self.ip_cnts.entry(ip.to_string()).or_insert(0) += 1;
    }

    fn dec_ip(&mut self, ip: &str) {
        if let Some(cnt) = self.ip_cnts.get_mut(ip) {
            if *cnt > 1 {
                *cnt -= 1;
            } else {
                self.ip_cnts.remove(ip);
            }
        }
    }
}

pub struct Bucket {
    inner: RwLock<BucketInner>,
    routines: Vec<mpsc::Sender<RoomPush>>,
    routine_num: AtomicU64,
}

impl Bucket {
    /// Build a bucket and spawn its room-broadcast worker lanes.
    pub fn new(workers: usize, queue: usize) -> Arc<Self> {
        let workers = workers.max(1);
        let mut routines = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(queue.max(1));
            routines.push(tx);
            receivers.push(rx);
        }
        let bucket = Arc::new(Self {
            inner: RwLock::new(BucketInner {
                chs: HashMap::default(),
                rooms: HashMap::default(),
                ip_cnts: HashMap::default(),
            }),
            routines,
            routine_num: AtomicU64::new(0),
        });
        for rx in receivers {
            tokio::spawn(room_proc(bucket.clone(), rx));
        }
        bucket
    }

    // -- channel registry ---------------------------------------------------

    /// Insert a channel. An existing session with the same key is evicted:
    /// one active session per key.
    pub fn put(&self, room_id: &str, ch: Arc<Channel>) -> Result<(), CometError> {
        {
            let mut inner = self.inner.write();
            if let Some(old) = inner.chs.insert(ch.key.clone(), ch.clone()) {
                old.close();
                let ip = old.ip.clone();
                inner.dec_ip(&ip);
            }
            inner.inc_ip(&ch.ip);
        }
        if !room_id.is_empty() {
            self.join_room(&ch, room_id)?;
        }
        Ok(())
    }

    /// Remove a channel — only if the slot still holds it, so a late delete
    /// never clobbers the session that evicted it. Leaves all joined rooms.
    pub fn del(&self, ch: &Arc<Channel>) {
        {
            let mut inner = self.inner.write();
            let matches = inner.chs.get(&ch.key).is_some_and(|cur| cur.id == ch.id);
            if matches {
                inner.chs.remove(&ch.key);
                let ip = ch.ip.clone();
                inner.dec_ip(&ip);
            }
        }
        for room_id in ch.rooms() {
            self.leave_room(ch, &room_id);
        }
    }

    pub fn channel(&self, key: &str) -> Option<Arc<Channel>> {
        self.inner.read().chs.get(key).cloned()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.read().chs.len()
    }

    /// Distinct peer IPs with at least one connection.
    pub fn ip_count(&self) -> usize {
        self.inner.read().ip_cnts.len()
    }

    // -- room membership ----------------------------------------------------

    /// Join a room, creating it on first use. A channel may be in many rooms.
    pub fn join_room(&self, ch: &Arc<Channel>, room_id: &str) -> Result<(), CometError> {
        if ch.has_room(room_id) {
            return Ok(());
        }
        let room = {
            let mut inner = self.inner.write();
            inner
                .rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Room::new(room_id.to_string()))
                .clone()
        };
        room.put(ch)?;
        ch.add_room(room_id);
        Ok(())
    }

    pub fn leave_room(&self, ch: &Arc<Channel>, room_id: &str) {
        if !ch.has_room(room_id) {
            return;
        }
        let room = self.inner.read().rooms.get(room_id).cloned();
        if let Some(room) = room {
            if room.del(ch) {
                self.del_room(&room);
            }
        }
        ch.remove_room(room_id);
    }

    /// `""` leaves every room; any other id joins it without leaving others.
    pub fn change_room(&self, ch: &Arc<Channel>, room_id: &str) -> Result<(), CometError> {
        if room_id.is_empty() {
            for joined in ch.rooms() {
                self.leave_room(ch, &joined);
            }
            return Ok(());
        }
        self.join_room(ch, room_id)
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.inner.read().rooms.get(room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.inner.read().rooms.len()
    }

    fn del_room(&self, room: &Room) {
        self.inner.write().rooms.remove(&room.id);
        room.close();
    }

    /// `{roomID → local member count}` for rooms with members.
    pub fn rooms_count(&self) -> HashMap<String, i32> {
        let inner = self.inner.read();
        inner
            .rooms
            .iter()
            .filter(|(_, room)| room.online() > 0)
            .map(|(id, room)| (id.clone(), room.online()))
            .collect()
    }

    /// Refresh every room's cross-gateway aggregate from the given counts.
    pub fn up_rooms_count(&self, counts: &HashMap<String, i32>) {
        let inner = self.inner.read();
        for (id, room) in inner.rooms.iter() {
            room.set_all_online(counts.get(id).copied().unwrap_or(0));
        }
    }

    // -- fan-out ------------------------------------------------------------

    /// Push to every channel watching `op`.
    pub fn broadcast(&self, proto: &Proto, op: i32) {
        let inner = self.inner.read();
        for ch in inner.chs.values() {
            if ch.need_push(op) {
                let _ = ch.push(proto.clone());
            }
        }
    }

    /// Route a room push onto one of the worker lanes. Blocks when every slot
    /// of the picked lane is taken, bounding the caller.
    pub async fn broadcast_room(&self, push: RoomPush) {
        let n = self.routine_num.fetch_add(1, Ordering::Relaxed) as usize % self.routines.len();
        let _ = self.routines[n].send(push).await;
    }

    #[cfg(test)]
    fn ip_refs(&self) -> i32 {
        self.inner.read().ip_cnts.values().sum()
    }
}

/// Worker lane: serially drain queued room pushes for this bucket.
async fn room_proc(bucket: Arc<Bucket>, mut rx: mpsc::Receiver<RoomPush>) {
    while let Some(push) = rx.recv().await {
        if let Some(room) = bucket.room(&push.room_id) {
            room.push(&push.proto);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Signal;

    fn conn(key: &str, ip: &str) -> (Arc<Channel>, mpsc::Receiver<Signal>) {
        Channel::new(8, 8, 0, key.into(), ip.into())
    }

    #[tokio::test]
    async fn put_with_same_key_evicts_old_session() {
        let bucket = Bucket::new(2, 8);
        let (a, _ra) = conn("K", "10.0.0.1");
        let (b, _rb) = conn("K", "10.0.0.2");

        bucket.put("", a.clone()).unwrap();
        bucket.put("", b.clone()).unwrap();

        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert_eq!(bucket.channel("K").unwrap().id, b.id);
        assert_eq!(bucket.channel_count(), 1);
    }

    #[tokio::test]
    async fn late_del_does_not_clobber_eviction() {
        let bucket = Bucket::new(2, 8);
        let (a, _ra) = conn("K", "10.0.0.1");
        let (b, _rb) = conn("K", "10.0.0.1");

        bucket.put("", a.clone()).unwrap();
        bucket.put("", b.clone()).unwrap();

        // The evicted session's teardown races the new session.
        bucket.del(&a);
        assert_eq!(bucket.channel("K").unwrap().id, b.id);
        assert_eq!(bucket.ip_refs(), 1);
    }

    #[tokio::test]
    async fn ip_refcount_matches_channel_count() {
        let bucket = Bucket::new(2, 8);
        let mut channels = Vec::new();
        for i in 0..12 {
            let ip = format!("10.0.0.{}", i % 3);
            let (ch, rx) = conn(&format!("k{i}"), &ip);
            bucket.put("", ch.clone()).unwrap();
            channels.push((ch, rx));
        }
        assert_eq!(bucket.ip_refs() as usize, bucket.channel_count());

        for (ch, _) in channels.iter().step_by(2) {
            bucket.del(ch);
        }
        assert_eq!(bucket.ip_refs() as usize, bucket.channel_count());
        assert_eq!(bucket.channel_count(), 6);

        for (ch, _) in channels.iter() {
            bucket.del(ch);
        }
        assert_eq!(bucket.channel_count(), 0);
        assert_eq!(bucket.ip_refs(), 0);
        assert_eq!(bucket.ip_count(), 0);
    }

    #[tokio::test]
    async fn membership_agrees_between_bucket_and_channel() {
        let bucket = Bucket::new(2, 8);
        let (ch, _rx) = conn("k", "10.0.0.1");
        bucket.put("chat://1", ch.clone()).unwrap();
        bucket.join_room(&ch, "chat://2").unwrap();

        assert!(ch.has_room("chat://1"));
        assert!(ch.has_room("chat://2"));
        assert_eq!(bucket.room("chat://1").unwrap().online(), 1);
        assert_eq!(bucket.room("chat://2").unwrap().online(), 1);

        bucket.leave_room(&ch, "chat://1");
        assert!(!ch.has_room("chat://1"));
        assert!(bucket.room("chat://1").is_none());
        assert_eq!(bucket.room("chat://2").unwrap().online(), 1);
    }

    #[tokio::test]
    async fn change_room_empty_leaves_all() {
        let bucket = Bucket::new(2, 8);
        let (ch, _rx) = conn("k", "10.0.0.1");
        bucket.put("chat://1", ch.clone()).unwrap();
        bucket.change_room(&ch, "chat://2").unwrap();
        assert_eq!(ch.rooms().len(), 2);

        bucket.change_room(&ch, "").unwrap();
        assert!(ch.rooms().is_empty());
        assert_eq!(bucket.room_count(), 0);
    }

    #[tokio::test]
    async fn del_leaves_all_rooms() {
        let bucket = Bucket::new(2, 8);
        let (ch, _rx) = conn("k", "10.0.0.1");
        bucket.put("chat://1", ch.clone()).unwrap();
        bucket.join_room(&ch, "chat://2").unwrap();

        bucket.del(&ch);
        assert_eq!(bucket.room_count(), 0);
        assert!(bucket.channel("k").is_none());
    }

    #[tokio::test]
    async fn broadcast_respects_watch_filter() {
        let bucket = Bucket::new(2, 8);
        let (a, mut ra) = conn("a", "10.0.0.1");
        let (b, mut rb) = conn("b", "10.0.0.2");
        a.watch(&[1000]);
        b.watch(&[2000]);
        bucket.put("", a.clone()).unwrap();
        bucket.put("", b.clone()).unwrap();

        bucket.broadcast(&Proto::new(1000, b"x".to_vec()), 1000);

        match ra.try_recv().unwrap() {
            Signal::Proto(p) => assert_eq!(p.op, 1000),
            other => panic!("unexpected signal: {other:?}"),
        }
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_room_flows_through_worker_lane() {
        let bucket = Bucket::new(2, 8);
        let (ch, mut rx) = conn("k", "10.0.0.1");
        bucket.put("chat://7", ch.clone()).unwrap();

        bucket
            .broadcast_room(RoomPush {
                room_id: "chat://7".into(),
                proto: Proto::new(1000, b"hi".to_vec()),
            })
            .await;

        match rx.recv().await.unwrap() {
            Signal::Proto(p) => assert_eq!(p.body, b"hi"),
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rooms_count_reports_occupied_rooms() {
        let bucket = Bucket::new(2, 8);
        let (a, _ra) = conn("a", "10.0.0.1");
        let (b, _rb) = conn("b", "10.0.0.1");
        bucket.put("chat://7", a.clone()).unwrap();
        bucket.put("chat://7", b.clone()).unwrap();

        let counts = bucket.rooms_count();
        assert_eq!(counts.get("chat://7"), Some(&2));

        bucket.up_rooms_count(&HashMap::from([("chat://7".to_string(), 9)]));
        assert_eq!(bucket.room("chat://7").unwrap().online_num(), 9);
    }
}
