//! LSN allocation
//!
//! Every namespace incarnation owns one allocator; epochs come from a
//! node-wide source so a dropped or renamed namespace never hands out
//! cursors that collide with its previous life.

use std::sync::atomic::{AtomicU64, Ordering};

use super::record::Lsn;

/// Monotonic counter for a single namespace epoch
#[derive(Debug, Clone)]
pub struct LsnAllocator {
    epoch: u64,
    next: u64,
}

impl LsnAllocator {
    /// Fresh allocator: the first LSN handed out has counter 0
    pub fn new(epoch: u64) -> Self {
        Self { epoch, next: 0 }
    }

    /// Recovered allocator resuming above the highest persisted counter
    pub fn resume(epoch: u64, last: Option<u64>) -> Self {
        Self {
            epoch,
            next: last.map(|c| c + 1).unwrap_or(0),
        }
    }

    pub fn allocate(&mut self) -> Lsn {
        let lsn = Lsn::new(self.epoch, self.next);
        self.next += 1;
        lsn
    }

    /// LSN the next allocation will return
    pub fn peek(&self) -> Lsn {
        Lsn::new(self.epoch, self.next)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn next_counter(&self) -> u64 {
        self.next
    }

    pub fn last_counter(&self) -> Option<u64> {
        self.next.checked_sub(1)
    }
}

/// Node-wide epoch generator
#[derive(Debug)]
pub struct EpochSource {
    last: AtomicU64,
}

impl EpochSource {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Next unused epoch
    pub fn next_epoch(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record an epoch adopted from a master so local epochs stay above it
    pub fn observe(&self, epoch: u64) {
        self.last.fetch_max(epoch, Ordering::SeqCst);
    }

    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for EpochSource {
    fn default() -> Self {
        Self::new()
    }
}
