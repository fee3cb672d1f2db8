//! Snapshot visibility decisions.
//!
//! Given a tuple version and a snapshot, the oracle decides visible or
//! not-visible. The rules are applied strictly in order:
//!
//! 1. A transaction always sees its own uncommitted writes, unless it has
//!    itself deleted the tuple.
//! 2. A version whose creator has not committed is invisible (covers
//!    aborted and still-active creators).
//! 3. A version whose creator lies at or beyond the snapshot's `xmax`, or
//!    was in progress when the snapshot was taken, is invisible.
//! 4. Otherwise the creator is visible-committed; an undeleted tuple is
//!    visible.
//! 5. A deleted tuple stays visible unless the deletion itself is both
//!    committed and inside the snapshot's horizon (or was performed by the
//!    reading transaction). An uncommitted or concurrent delete leaves the
//!    tuple readable (the "ghost" case).
//!
//! Status lookups are cached on the version via hint flags, and versions
//! frozen by vacuum skip the snapshot-horizon test entirely.

use mvheap_txn::{Snapshot, Txid, TxidAllocator, TxidStatus};

use crate::heap::TupleVersion;

/// Resolved fate of a version's creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreatorOutcome {
    Committed,
    Aborted,
    /// In progress, or unresolvable (never allocated / pruned).
    Pending,
}

pub struct VisibilityOracle<'a> {
    allocator: &'a TxidAllocator,
}

impl<'a> VisibilityOracle<'a> {
    pub fn new(allocator: &'a TxidAllocator) -> Self {
        Self { allocator }
    }

    pub(crate) fn txid_status(&self, id: Txid) -> TxidStatus {
        self.allocator.status(id)
    }

    /// Creator status with hint-flag caching: once a creator is known
    /// committed or aborted the fact is stamped on the version so later
    /// walks skip the status-table lookup.
    pub(crate) fn creator_outcome(&self, version: &TupleVersion) -> CreatorOutcome {
        if let Some(committed) = version.creator_hint() {
            return if committed {
                CreatorOutcome::Committed
            } else {
                CreatorOutcome::Aborted
            };
        }
        match self.allocator.status(version.created_by()) {
            TxidStatus::Committed => {
                version.mark_creator_committed();
                CreatorOutcome::Committed
            }
            TxidStatus::Aborted => {
                version.mark_creator_aborted();
                CreatorOutcome::Aborted
            }
            TxidStatus::InProgress | TxidStatus::Unknown => CreatorOutcome::Pending,
        }
    }

    pub fn is_visible(&self, version: &TupleVersion, snapshot: &Snapshot, me: Txid) -> bool {
        // Rule 1: own writes, unless deleted by self.
        if version.created_by() == me {
            return version.deleted_by() != Some(me);
        }

        // Rule 2: the creator must have committed.
        if self.creator_outcome(version) != CreatorOutcome::Committed {
            return false;
        }

        // Rule 3: the commit must be inside the snapshot's horizon. Frozen
        // versions predate every live snapshot, so the test is skipped.
        if !version.is_frozen() && !snapshot.sees(version.created_by()) {
            return false;
        }

        // Rules 4 and 5: only a committed, snapshot-visible deletion (or
        // the reader's own) hides the tuple.
        match version.deleted_by() {
            None => true,
            Some(d) if d == me => false,
            Some(d) => {
                !(self.allocator.status(d) == TxidStatus::Committed && snapshot.sees(d))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mvheap_txn::Snapshot;

    use super::*;
    use crate::heap::VersionStore;

    struct Fixture {
        alloc: TxidAllocator,
        store: VersionStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                alloc: TxidAllocator::new(),
                store: VersionStore::new(64),
            }
        }

        fn snapshot(&self, in_progress: Vec<Txid>) -> Snapshot {
            let next = self.alloc.peek_next();
            let xmin = in_progress.first().copied().unwrap_or(next);
            Snapshot::new(xmin, next, in_progress)
        }
    }

    #[test]
    fn test_own_uncommitted_write_is_visible() {
        let f = Fixture::new();
        let me = f.alloc.allocate().unwrap();
        f.store.insert(1, b"mine".to_vec(), me);
        let snap = f.snapshot(vec![]);

        let oracle = VisibilityOracle::new(&f.alloc);
        let (_, v) = f.store.newest_qualifying(1, me, &oracle).unwrap();
        assert!(oracle.is_visible(&v, &snap, me));

        // Other transactions do not see it.
        let other = f.alloc.allocate().unwrap();
        assert!(!oracle.is_visible(&v, &snap, other));
    }

    #[test]
    fn test_own_delete_hides_tuple_from_self_only() {
        let f = Fixture::new();
        let writer = f.alloc.allocate().unwrap();
        f.store.insert(1, b"x".to_vec(), writer);
        f.alloc.mark_committed(writer).unwrap();

        let oracle = VisibilityOracle::new(&f.alloc);
        let me = f.alloc.allocate().unwrap();
        let (_, v) = f.store.newest_qualifying(1, me, &oracle).unwrap();
        f.store.set_deleted(&v, me, &oracle).unwrap();

        let snap = f.snapshot(vec![me]);
        assert!(!oracle.is_visible(&v, &snap, me));

        // The uncommitted delete is a ghost for everyone else.
        let other = f.alloc.allocate().unwrap();
        let other_snap = f.snapshot(vec![me, other]);
        assert!(oracle.is_visible(&v, &other_snap, other));
    }

    #[test]
    fn test_aborted_creator_is_invisible() {
        let f = Fixture::new();
        let writer = f.alloc.allocate().unwrap();
        f.store.insert(1, b"x".to_vec(), writer);
        f.alloc.mark_aborted(writer).unwrap();

        let oracle = VisibilityOracle::new(&f.alloc);
        let v = f.store.get_version(f.store.head_of(1).unwrap()).unwrap();
        let me = f.alloc.allocate().unwrap();
        assert!(!oracle.is_visible(&v, &f.snapshot(vec![me]), me));
    }

    #[test]
    fn test_future_and_concurrent_creators_are_invisible() {
        let f = Fixture::new();
        let oracle = VisibilityOracle::new(&f.alloc);

        // Concurrent: in the snapshot's in-progress set, even if it has
        // committed by the time the read happens.
        let concurrent = f.alloc.allocate().unwrap();
        let me = f.alloc.allocate().unwrap();
        let snap = f.snapshot(vec![concurrent]);

        f.store.insert(1, b"x".to_vec(), concurrent);
        f.alloc.mark_committed(concurrent).unwrap();
        let v = f.store.get_version(f.store.head_of(1).unwrap()).unwrap();
        assert!(!oracle.is_visible(&v, &snap, me));

        // Future: allocated at or beyond xmax.
        let future = f.alloc.allocate().unwrap();
        f.store.insert(2, b"y".to_vec(), future);
        f.alloc.mark_committed(future).unwrap();
        let v2 = f.store.get_version(f.store.head_of(2).unwrap()).unwrap();
        assert!(!oracle.is_visible(&v2, &snap, me));
    }

    #[test]
    fn test_committed_concurrent_delete_is_a_ghost() {
        let f = Fixture::new();
        let writer = f.alloc.allocate().unwrap();
        f.store.insert(1, b"x".to_vec(), writer);
        f.alloc.mark_committed(writer).unwrap();

        let oracle = VisibilityOracle::new(&f.alloc);

        // Snapshot taken before the delete starts.
        let me = f.alloc.allocate().unwrap();
        let snap = f.snapshot(vec![me]);

        let deleter = f.alloc.allocate().unwrap();
        let (_, v) = f.store.newest_qualifying(1, deleter, &oracle).unwrap();
        f.store.set_deleted(&v, deleter, &oracle).unwrap();
        f.alloc.mark_committed(deleter).unwrap();

        // The delete committed, but after the snapshot: still visible.
        assert!(oracle.is_visible(&v, &snap, me));

        // A later snapshot sees the delete.
        let late_reader = f.alloc.allocate().unwrap();
        let late_snap = f.snapshot(vec![late_reader]);
        assert!(!oracle.is_visible(&v, &late_snap, late_reader));
    }

    #[test]
    fn test_frozen_version_skips_horizon_test() {
        let f = Fixture::new();
        let writer = f.alloc.allocate().unwrap();
        f.store.insert(1, b"x".to_vec(), writer);
        f.alloc.mark_committed(writer).unwrap();

        let v = f.store.get_version(f.store.head_of(1).unwrap()).unwrap();
        v.mark_frozen();

        // Even a snapshot that lists the creator as in-progress (stale
        // bookkeeping cannot happen for frozen versions in practice) sees
        // the frozen version.
        let oracle = VisibilityOracle::new(&f.alloc);
        let me = f.alloc.allocate().unwrap();
        let snap = Snapshot::new(writer, writer, vec![]);
        assert!(oracle.is_visible(&v, &snap, me));
    }

    #[test]
    fn test_hint_flags_are_cached() {
        let f = Fixture::new();
        let writer = f.alloc.allocate().unwrap();
        f.store.insert(1, b"x".to_vec(), writer);
        f.alloc.mark_committed(writer).unwrap();

        let oracle = VisibilityOracle::new(&f.alloc);
        let v = f.store.get_version(f.store.head_of(1).unwrap()).unwrap();
        assert_eq!(v.creator_hint(), None);
        assert_eq!(oracle.creator_outcome(&v), CreatorOutcome::Committed);
        assert_eq!(v.creator_hint(), Some(true));

        // The cached hint keeps working after the status entry is pruned.
        f.alloc.truncate_below(f.alloc.peek_next());
        assert_eq!(oracle.creator_outcome(&v), CreatorOutcome::Committed);
    }
}
