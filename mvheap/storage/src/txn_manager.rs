//! Active-transaction table and snapshot capture.
//!
//! The table owns the txid allocator, the set of in-flight transactions,
//! and the transaction latch. The latch is what makes commit visibility
//! atomic: begins and commits take it exclusively, snapshot capture takes
//! it shared, so a snapshot always observes a consistent pairing of
//! (active set, next txid) and a commit is visible to every snapshot taken
//! after `mark_committed` completes.

use std::sync::Weak;
use std::sync::atomic::AtomicU64;

use crossbeam_skiplist::SkipMap;
use mvheap_txn::{Snapshot, Txid, TxidAllocator};
use parking_lot::RwLock;

use crate::transaction::HeapTransaction;

pub(crate) struct TxnTable {
    pub(crate) allocator: TxidAllocator,
    /// In-flight transactions by raw txid. Weak so that an abandoned
    /// handle still drops (and rolls back) instead of leaking here.
    pub(crate) active: SkipMap<u64, Weak<HeapTransaction>>,
    pub(crate) latch: RwLock<()>,
    pub(crate) finished_since_vacuum: AtomicU64,
}

impl TxnTable {
    pub(crate) fn new() -> Self {
        Self {
            allocator: TxidAllocator::new(),
            active: SkipMap::new(),
            latch: RwLock::new(()),
            finished_since_vacuum: AtomicU64::new(0),
        }
    }

    /// Capture a snapshot for `own` under the shared latch. `xmin` is the
    /// oldest active transaction (including `own`); `in_progress` excludes
    /// `own` since a transaction always sees its own writes.
    pub(crate) fn capture_snapshot(&self, own: Txid) -> Snapshot {
        let _latch = self.latch.read();
        let xmax = self.allocator.peek_next();
        let mut xmin = xmax;
        let mut in_progress = Vec::new();
        for entry in self.active.iter() {
            let id = Txid::from_raw(*entry.key());
            xmin = xmin.min(id);
            if id != own {
                in_progress.push(id);
            }
        }
        Snapshot::new(xmin, xmax, in_progress)
    }

    pub(crate) fn oldest_active(&self) -> Option<Txid> {
        self.active.front().map(|e| Txid::from_raw(*e.key()))
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active.len()
    }
}
