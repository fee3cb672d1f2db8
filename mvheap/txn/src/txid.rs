//! Transaction id allocation and commit-status tracking.
//!
//! Every transaction is identified by a [`Txid`] drawn from a strictly
//! increasing counter. The allocator doubles as the commit log: it records
//! whether each recent id is in progress, committed, or aborted, which is
//! what the visibility oracle consults when it resolves a tuple version.
//! The table is bounded: vacuum prunes entries once hint flags on the
//! surviving versions make the status lookup unnecessary.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};

use crate::error::TxidError;

/// Transaction identifier. `0` is reserved as the "no transaction" sentinel
/// so that atomic fields can encode `Option<Txid>` in a bare `u64`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Txid(u64);

impl Txid {
    /// The first id the allocator hands out.
    pub const FIRST: u64 = 1;

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Txid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commit status of a transaction id.
///
/// `Unknown` covers ids that were never allocated as well as ids whose
/// status entry has been pruned; callers must only prune an id once every
/// surviving version that references it carries a hint flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxidStatus {
    InProgress,
    Committed,
    Aborted,
    Unknown,
}

const STATUS_IN_PROGRESS: u8 = 0;
const STATUS_COMMITTED: u8 = 1;
const STATUS_ABORTED: u8 = 2;

fn decode(raw: u8) -> TxidStatus {
    match raw {
        STATUS_IN_PROGRESS => TxidStatus::InProgress,
        STATUS_COMMITTED => TxidStatus::Committed,
        _ => TxidStatus::Aborted,
    }
}

/// Allocator and status table for transaction ids.
///
/// All operations are linearizable: allocation is a CAS loop on an atomic
/// counter, and status transitions are single compare-exchanges on the
/// per-id status byte. `mark_committed` in particular is the one atomic
/// step that makes a transaction's writes visible to later snapshots.
pub struct TxidAllocator {
    next: AtomicU64,
    status: SkipMap<u64, AtomicU8>,
}

impl TxidAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(Txid::FIRST),
            status: SkipMap::new(),
        }
    }

    /// Allocate the next id and register it as in progress.
    pub fn allocate(&self) -> Result<Txid, TxidError> {
        let mut cur = self.next.load(Ordering::SeqCst);
        loop {
            if cur == u64::MAX {
                return Err(TxidError::Overflow(cur));
            }
            match self
                .next
                .compare_exchange_weak(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.status
                        .insert(cur, AtomicU8::new(STATUS_IN_PROGRESS));
                    return Ok(Txid::from_raw(cur));
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// The id the next `allocate` call would return. Snapshots use this as
    /// their `xmax`.
    pub fn peek_next(&self) -> Txid {
        Txid::from_raw(self.next.load(Ordering::SeqCst))
    }

    /// Current status of `id`. Ids never allocated, and ids whose entry has
    /// been pruned, report `Unknown`.
    pub fn status(&self, id: Txid) -> TxidStatus {
        if id.raw() >= self.next.load(Ordering::SeqCst) {
            return TxidStatus::Unknown;
        }
        match self.status.get(&id.raw()) {
            Some(entry) => decode(entry.value().load(Ordering::Acquire)),
            None => TxidStatus::Unknown,
        }
    }

    pub fn mark_committed(&self, id: Txid) -> Result<(), TxidError> {
        self.transition(id, STATUS_COMMITTED, TxidStatus::Committed)
    }

    pub fn mark_aborted(&self, id: Txid) -> Result<(), TxidError> {
        self.transition(id, STATUS_ABORTED, TxidStatus::Aborted)
    }

    fn transition(&self, id: Txid, to_raw: u8, to: TxidStatus) -> Result<(), TxidError> {
        let entry = self
            .status
            .get(&id.raw())
            .ok_or(TxidError::InvalidStateTransition {
                txid: id.raw(),
                from: TxidStatus::Unknown,
                to,
            })?;
        entry
            .value()
            .compare_exchange(
                STATUS_IN_PROGRESS,
                to_raw,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(|prev| TxidError::InvalidStateTransition {
                txid: id.raw(),
                from: decode(prev),
                to,
            })
    }

    /// Drop terminal status entries below `horizon`. In-progress entries are
    /// kept regardless; the caller computes the horizon so that none exist
    /// below it. Returns the number of entries removed.
    pub fn truncate_below(&self, horizon: Txid) -> usize {
        let mut removed = 0;
        for entry in self.status.range(..horizon.raw()) {
            if decode(entry.value().load(Ordering::Acquire)) != TxidStatus::InProgress
                && entry.remove()
            {
                removed += 1;
            }
        }
        removed
    }

    /// Number of status entries currently retained.
    pub fn retained(&self) -> usize {
        self.status.len()
    }
}

impl Default for TxidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_strictly_increasing() {
        let alloc = TxidAllocator::new();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!(a.raw(), Txid::FIRST);
        assert!(b > a);
        assert_eq!(alloc.peek_next().raw(), b.raw() + 1);
    }

    #[test]
    fn test_status_lifecycle() {
        let alloc = TxidAllocator::new();
        let id = alloc.allocate().unwrap();
        assert_eq!(alloc.status(id), TxidStatus::InProgress);

        alloc.mark_committed(id).unwrap();
        assert_eq!(alloc.status(id), TxidStatus::Committed);

        // A second transition on the same id is a caller bug.
        assert!(matches!(
            alloc.mark_aborted(id),
            Err(TxidError::InvalidStateTransition { .. })
        ));
        assert_eq!(alloc.status(id), TxidStatus::Committed);
    }

    #[test]
    fn test_unallocated_ids_are_unknown() {
        let alloc = TxidAllocator::new();
        assert_eq!(alloc.status(Txid::from_raw(99)), TxidStatus::Unknown);
    }

    #[test]
    fn test_truncate_below_keeps_in_progress() {
        let alloc = TxidAllocator::new();
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        let c = alloc.allocate().unwrap();
        alloc.mark_committed(a).unwrap();
        alloc.mark_aborted(b).unwrap();

        let removed = alloc.truncate_below(Txid::from_raw(c.raw() + 1));
        assert_eq!(removed, 2);
        assert_eq!(alloc.status(a), TxidStatus::Unknown);
        assert_eq!(alloc.status(c), TxidStatus::InProgress);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let alloc = Arc::new(TxidAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = alloc.clone();
            handles.push(std::thread::spawn(move || {
                (0..200)
                    .map(|_| alloc.allocate().unwrap().raw())
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate txid {id}");
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
