//! Fixed-capacity ring buffer of inbound client protos.
//!
//! The reader task appends parsed requests (already transformed into their
//! replies); the writer task drains them when it receives the ready signal.
//! Capacity is rounded up to a power of two so slot indexing is a mask.

use relay_protocol::Proto;

use crate::error::CometError;

pub struct Ring {
    rp: u64,
    wp: u64,
    mask: u64,
    data: Vec<Proto>,
}

impl Ring {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1).next_power_of_two();
        Self {
            rp: 0,
            wp: 0,
            mask: cap as u64 - 1,
            data: vec![Proto::default(); cap],
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        (self.wp - self.rp) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.rp == self.wp
    }

    /// Append a proto. Fails when the writer has fallen a full ring behind.
    pub fn set(&mut self, proto: Proto) -> Result<(), CometError> {
        if self.len() == self.data.len() {
            return Err(CometError::RingFull);
        }
        let idx = (self.wp & self.mask) as usize;
        self.data[idx] = proto;
        self.wp = self.wp.wrapping_add(1);
        Ok(())
    }

    /// Take the oldest proto, if any.
    pub fn get(&mut self) -> Option<Proto> {
        if self.is_empty() {
            return None;
        }
        let idx = (self.rp & self.mask) as usize;
        let proto = std::mem::take(&mut self.data[idx]);
        self.rp = self.rp.wrapping_add(1);
        Some(proto)
    }
}
