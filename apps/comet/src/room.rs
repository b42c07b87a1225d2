//! A named multicast group within a bucket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use relay_protocol::Proto;

use crate::channel::Channel;
use crate::error::CometError;

struct RoomInner {
    /// Members keyed by channel id.
    members: HashMap<u64, Arc<Channel>>,
    /// Set when the last member left; a dropped room accepts no more puts and
    /// is removed from its bucket by the caller observing the flag.
    drop: bool,
}

pub struct Room {
    pub id: String,
    inner: RwLock<RoomInner>,
    /// Local member count; dirty reads are fine.
    online: AtomicI32,
    /// Cross-gateway aggregate, advisory, refreshed by the online tick.
    all_online: AtomicI32,
}

impl Room {
    pub fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: RwLock::new(RoomInner {
                members: HashMap::new(),
                drop: false,
            }),
            online: AtomicI32::new(0),
            all_online: AtomicI32::new(0),
        })
    }

    pub fn put(&self, ch: &Arc<Channel>) -> Result<(), CometError> {
        let mut inner = self.inner.write();
        if inner.drop {
            return Err(CometError::RoomDropped);
        }
        if inner.members.insert(ch.id, ch.clone()).is_none() {
            self.online.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Remove a member. Returns true when the room just became empty, in
    /// which case the caller removes it from the bucket.
    pub fn del(&self, ch: &Channel) -> bool {
        let mut inner = self.inner.write();
        if inner.members.remove(&ch.id).is_some() {
            self.online.fetch_sub(1, Ordering::Relaxed);
        }
        inner.drop = self.online.load(Ordering::Relaxed) == 0;
        inner.drop
    }

    /// Fan a proto out to every member. Per-member drops are silent — the
    /// channel's queue contract applies.
    pub fn push(&self, proto: &Proto) {
        let inner = self.inner.read();
        for ch in inner.members.values() {
            let _ = ch.push(proto.clone());
        }
    }

    /// Close every member session.
    pub fn close(&self) {
        let inner = self.inner.read();
        for ch in inner.members.values() {
            ch.close();
        }
    }

    pub fn online(&self) -> i32 {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_all_online(&self, n: i32) {
        self.all_online.store(n, Ordering::Relaxed);
    }

    /// Prefer the cross-gateway aggregate when one has been reported.
    pub fn online_num(&self) -> i32 {
        let all = self.all_online.load(Ordering::Relaxed);
        if all > 0 {
            all
        } else {
            self.online()
        }
    }
}
