//! WAL Ring
//!
//! Bounded, ordered log of one namespace incarnation. The ring owns the
//! namespace's LSN allocator, so assigning an LSN and storing the record
//! happen in the same critical section.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::lsn::LsnAllocator;
use super::record::{DataState, Lsn, ReplicationState, WalOp, WalRecord};
use crate::error::{Error, Result};

/// Retention limits of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalCapacity {
    /// Maximum number of retained records
    pub max_records: usize,
    /// Optional cap on the approximate retained size
    #[serde(default)]
    pub max_bytes: Option<usize>,
}

impl WalCapacity {
    pub fn records(max_records: usize) -> Self {
        Self {
            max_records,
            max_bytes: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

impl Default for WalCapacity {
    fn default() -> Self {
        Self::records(100_000)
    }
}

/// Position and retention window of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingWindow {
    pub epoch: u64,
    /// Counter of the oldest retained record (== next counter when empty)
    pub first_retained: u64,
    /// Counter the next append will receive
    pub next: u64,
    pub retained: usize,
    pub retained_bytes: usize,
}

impl RingWindow {
    pub fn last_counter(&self) -> Option<u64> {
        self.next.checked_sub(1)
    }

    /// First counter to read after the cursor, if the window covers it.
    /// A cursor is usable iff `first_retained <= after + 1 <= next`;
    /// `None` stands for "before counter 0".
    pub fn start_after(&self, after: Option<u64>) -> Option<u64> {
        let following = match after {
            Some(c) => c.checked_add(1)?,
            None => 0,
        };
        (self.first_retained <= following && following <= self.next).then_some(following)
    }
}

/// Bounded record ring for one namespace epoch
#[derive(Debug)]
pub struct WalRing {
    namespace: String,
    allocator: LsnAllocator,
    records: VecDeque<Arc<WalRecord>>,
    capacity: WalCapacity,
    retained_bytes: usize,
    data: DataState,
    retired: bool,
}

impl WalRing {
    /// Create an empty ring for a fresh epoch
    pub fn new(namespace: impl Into<String>, epoch: u64, capacity: WalCapacity) -> Self {
        Self::resume(namespace, epoch, None, DataState::default(), capacity)
    }

    /// Create an empty ring positioned right after `last` (full sync / recovery)
    pub fn resume(
        namespace: impl Into<String>,
        epoch: u64,
        last: Option<u64>,
        data: DataState,
        capacity: WalCapacity,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            allocator: LsnAllocator::resume(epoch, last),
            records: VecDeque::new(),
            capacity,
            retained_bytes: 0,
            data,
            retired: false,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn epoch(&self) -> u64 {
        self.allocator.epoch()
    }

    pub fn capacity(&self) -> WalCapacity {
        self.capacity
    }

    pub fn window(&self) -> RingWindow {
        RingWindow {
            epoch: self.allocator.epoch(),
            first_retained: self.first_retained(),
            next: self.allocator.next_counter(),
            retained: self.records.len(),
            retained_bytes: self.retained_bytes,
        }
    }

    fn first_retained(&self) -> u64 {
        self.allocator.next_counter() - self.records.len() as u64
    }

    /// Replication state as of the last append
    pub fn state(&self) -> ReplicationState {
        ReplicationState {
            epoch: self.allocator.epoch(),
            last_counter: self.allocator.last_counter(),
            data_hash: self.data.data_hash,
            data_count: self.data.data_count,
        }
    }

    /// Assign the next LSN, store the record and evict overflow.
    ///
    /// `data` is the namespace digest after the mutation was applied.
    pub fn append(&mut self, op: WalOp, data: DataState) -> Arc<WalRecord> {
        let lsn = self.allocator.allocate();
        let record = Arc::new(WalRecord::new(lsn, self.namespace.clone(), op));
        self.push(Arc::clone(&record), data);
        record
    }

    /// Allocate the final LSN of this epoch for a drop / rename record and
    /// retire the ring. The record is published but not retained.
    pub fn retire(&mut self, op: WalOp) -> Arc<WalRecord> {
        let lsn = self.allocator.allocate();
        self.retired = true;
        self.records.clear();
        self.retained_bytes = 0;
        Arc::new(WalRecord::new(lsn, self.namespace.clone(), op))
    }

    /// Retire the ring with a drop / rename record received from a master
    pub fn retire_replicated(&mut self, record: WalRecord) -> Result<Arc<WalRecord>> {
        self.expect_next(record.lsn())?;
        self.allocator.allocate();
        self.retired = true;
        self.records.clear();
        self.retained_bytes = 0;
        Ok(Arc::new(record))
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Check that `lsn` is exactly the next position of this ring
    pub fn expect_next(&self, lsn: Lsn) -> Result<()> {
        let expected = self.allocator.peek();
        if lsn.epoch != expected.epoch {
            return Err(Error::EpochMismatch {
                namespace: self.namespace.clone(),
                local: expected.epoch,
                remote: lsn.epoch,
            });
        }
        if lsn.counter != expected.counter {
            return Err(Error::LsnGap {
                namespace: self.namespace.clone(),
                expected,
                got: lsn,
            });
        }
        Ok(())
    }

    /// Store a record replicated from a master, keeping the master's LSN
    pub fn append_replicated(&mut self, record: WalRecord, data: DataState) -> Result<Arc<WalRecord>> {
        self.expect_next(record.lsn())?;
        self.allocator.allocate();
        let record = Arc::new(record);
        self.push(Arc::clone(&record), data);
        Ok(record)
    }

    fn push(&mut self, record: Arc<WalRecord>, data: DataState) {
        self.retained_bytes += record.size_bytes();
        self.records.push_back(record);
        self.data = data;
        self.evict_overflow();
    }

    fn over_capacity(&self) -> bool {
        if self.records.len() > self.capacity.max_records {
            return true;
        }
        matches!(self.capacity.max_bytes, Some(max) if self.retained_bytes > max)
    }

    fn evict_overflow(&mut self) -> usize {
        let mut evicted = 0;
        while self.over_capacity() {
            match self.records.pop_front() {
                Some(oldest) => {
                    self.retained_bytes -= oldest.size_bytes();
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }

    /// Change retention. Shrinking evicts immediately; growing only moves
    /// the future eviction threshold.
    pub fn resize(&mut self, capacity: WalCapacity) -> usize {
        self.capacity = capacity;
        self.evict_overflow()
    }

    /// Records with counter > `after`, preceded by one raw state record.
    ///
    /// The returned vector is a snapshot: later appends, evictions or
    /// resizes do not affect it.
    pub fn read_after(&self, epoch: u64, after: Option<u64>) -> Result<Vec<Arc<WalRecord>>> {
        let window = self.window();
        let following = match window.start_after(after) {
            Some(following) if epoch == window.epoch => following,
            _ => {
                return Err(Error::OutdatedWal {
                    namespace: self.namespace.clone(),
                    requested: after,
                })
            }
        };

        let start = (following - window.first_retained) as usize;
        let mut result = Vec::with_capacity(self.records.len() - start + 1);
        result.push(Arc::new(WalRecord::state_snapshot(
            Lsn::new(window.epoch, after.unwrap_or(0)),
            self.namespace.clone(),
            self.state(),
        )));
        result.extend(self.records.range(start..).cloned());
        Ok(result)
    }
}
