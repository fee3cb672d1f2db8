//! Version store: the heap of tuple versions.
//!
//! Every logical row maps to a backward-chained list of immutable
//! [`TupleVersion`]s, newest first. Versions live in an arena keyed by a
//! monotonically increasing [`VersionId`]; chains are linked through atomic
//! version-id fields rather than pointers, so readers can walk a chain
//! lock-free while vacuum relinks it.
//!
//! The heap performs no locking itself: callers must already hold the
//! row's exclusive lock for any mutation (an assertion boundary enforced by
//! the coordinator). Reads rely purely on the visibility oracle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use dashmap::DashMap;
use mvheap_txn::{Snapshot, Txid, TxidStatus};
use parking_lot::Mutex;

use crate::visibility::{CreatorOutcome, VisibilityOracle};

/// Stable logical identifier of a row, independent of physical placement.
pub type RowKey = u64;

/// Arena index of a tuple version. `0` is reserved for "no version".
pub type VersionId = u64;

/// Identifier of a storage unit (a fixed span of row keys). Units are the
/// granularity of the all-visible marker and of vacuum's scan lock.
pub type UnitId = u64;

const FLAG_CREATOR_COMMITTED: u8 = 0b001;
const FLAG_CREATOR_ABORTED: u8 = 0b010;
const FLAG_FROZEN: u8 = 0b100;

/// One immutable physical representation of a row at a point in its
/// history. `deleted_by` and `next` are the two controlled exceptions to
/// immutability: the former is stamped by the deleting transaction, the
/// latter is rewritten only by vacuum when it unlinks dead versions.
pub struct TupleVersion {
    row_key: RowKey,
    created_by: Txid,
    deleted_by: AtomicU64,
    flags: AtomicU8,
    next: AtomicU64,
    payload: Vec<u8>,
}

impl TupleVersion {
    fn new(row_key: RowKey, created_by: Txid, payload: Vec<u8>, next: VersionId) -> Self {
        Self {
            row_key,
            created_by,
            deleted_by: AtomicU64::new(0),
            flags: AtomicU8::new(0),
            next: AtomicU64::new(next),
            payload,
        }
    }

    pub fn row_key(&self) -> RowKey {
        self.row_key
    }

    pub fn created_by(&self) -> Txid {
        self.created_by
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn deleted_by(&self) -> Option<Txid> {
        match self.deleted_by.load(Ordering::Acquire) {
            0 => None,
            raw => Some(Txid::from_raw(raw)),
        }
    }

    pub fn next_version(&self) -> Option<VersionId> {
        match self.next.load(Ordering::Acquire) {
            0 => None,
            vid => Some(vid),
        }
    }

    pub(crate) fn set_next(&self, next: Option<VersionId>) {
        self.next.store(next.unwrap_or(0), Ordering::Release);
    }

    /// Cached creator status: `Some(true)` committed, `Some(false)` aborted,
    /// `None` not yet resolved.
    pub(crate) fn creator_hint(&self) -> Option<bool> {
        let flags = self.flags.load(Ordering::Acquire);
        if flags & FLAG_CREATOR_COMMITTED != 0 {
            Some(true)
        } else if flags & FLAG_CREATOR_ABORTED != 0 {
            Some(false)
        } else {
            None
        }
    }

    pub(crate) fn mark_creator_committed(&self) {
        self.flags.fetch_or(FLAG_CREATOR_COMMITTED, Ordering::AcqRel);
    }

    pub(crate) fn mark_creator_aborted(&self) {
        self.flags.fetch_or(FLAG_CREATOR_ABORTED, Ordering::AcqRel);
    }

    /// Frozen versions have a creator that committed below a past
    /// reclamation horizon: they predate every live and future snapshot,
    /// so the snapshot-side visibility test can be skipped.
    pub fn is_frozen(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_FROZEN != 0
    }

    pub(crate) fn mark_frozen(&self) {
        self.flags
            .fetch_or(FLAG_FROZEN | FLAG_CREATOR_COMMITTED, Ordering::AcqRel);
    }

    /// Vacuum resets a `deleted_by` stamp left behind by an aborted
    /// deleter. Returns false if the field moved concurrently.
    pub(crate) fn clear_deleted(&self, expected: Txid) -> bool {
        self.deleted_by
            .compare_exchange(expected.raw(), 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl std::fmt::Debug for TupleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleVersion")
            .field("row_key", &self.row_key)
            .field("created_by", &self.created_by)
            .field("deleted_by", &self.deleted_by())
            .field("next", &self.next_version())
            .finish()
    }
}

/// Outcome of trying to stamp a delete on a version.
pub(crate) enum SetDeletedError {
    /// A committed transaction already deleted this version.
    AlreadyDeletedBy(Txid),
    /// The version was already deleted by the calling transaction itself.
    SelfDeleted,
    /// An in-progress transaction holds the delete stamp. Under the lock
    /// discipline this indicates a caller bug.
    PendingDeleter(Txid),
}

pub(crate) struct RowSlot {
    pub(crate) head: AtomicU64,
}

/// Per-unit bookkeeping: the all-visible marker, a seqlock-style mutation
/// epoch (odd while a writer is republishing a chain), and the scan mutex
/// vacuum holds while sweeping the unit.
pub(crate) struct UnitState {
    pub(crate) all_visible: AtomicBool,
    pub(crate) epoch: AtomicU64,
    pub(crate) scan_lock: Mutex<()>,
}

impl UnitState {
    fn new() -> Self {
        Self {
            all_visible: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            scan_lock: Mutex::new(()),
        }
    }
}

pub struct VersionStore {
    pub(crate) rows: DashMap<RowKey, RowSlot>,
    pub(crate) versions: DashMap<VersionId, Arc<TupleVersion>>,
    pub(crate) units: DashMap<UnitId, Arc<UnitState>>,
    next_version: AtomicU64,
    rows_per_unit: u64,
}

impl VersionStore {
    pub fn new(rows_per_unit: u64) -> Self {
        debug_assert!(rows_per_unit > 0);
        Self {
            rows: DashMap::new(),
            versions: DashMap::new(),
            units: DashMap::new(),
            next_version: AtomicU64::new(1),
            rows_per_unit,
        }
    }

    pub fn unit_of(&self, row: RowKey) -> UnitId {
        row / self.rows_per_unit
    }

    pub(crate) fn unit_state(&self, unit: UnitId) -> Arc<UnitState> {
        self.units
            .entry(unit)
            .or_insert_with(|| Arc::new(UnitState::new()))
            .clone()
    }

    /// Whether the unit is currently marked all-visible, i.e. every row in
    /// it is a single frozen, undeleted version.
    pub fn unit_all_visible(&self, unit: UnitId) -> bool {
        self.units
            .get(&unit)
            .map(|u| u.all_visible.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Append a new version for `row` and publish it as the chain head.
    /// The caller must hold the row's exclusive lock.
    pub fn insert(&self, row: RowKey, payload: Vec<u8>, txid: Txid) -> VersionId {
        let unit = self.unit_state(self.unit_of(row));
        unit.epoch.fetch_add(1, Ordering::AcqRel);
        unit.all_visible.store(false, Ordering::Release);

        let vid = self.next_version.fetch_add(1, Ordering::SeqCst);
        let slot = self.rows.entry(row).or_insert_with(|| RowSlot {
            head: AtomicU64::new(0),
        });
        let prev = slot.head.load(Ordering::Acquire);
        let version = Arc::new(TupleVersion::new(row, txid, payload, prev));
        self.versions.insert(vid, version);
        slot.head.store(vid, Ordering::Release);
        drop(slot);

        unit.epoch.fetch_add(1, Ordering::AcqRel);
        vid
    }

    pub(crate) fn get_version(&self, vid: VersionId) -> Option<Arc<TupleVersion>> {
        self.versions.get(&vid).map(|e| e.value().clone())
    }

    pub(crate) fn head_of(&self, row: RowKey) -> Option<VersionId> {
        self.rows.get(&row).and_then(|s| {
            match s.head.load(Ordering::Acquire) {
                0 => None,
                vid => Some(vid),
            }
        })
    }

    /// Walk the chain for `row`, newest to oldest. Versions already pulled
    /// from the arena by vacuum terminate the walk; by the reclamation
    /// invariant nothing visible can lie beyond them.
    pub fn chain(&self, row: RowKey) -> Vec<(VersionId, Arc<TupleVersion>)> {
        let mut out = Vec::new();
        let mut cur = self.head_of(row).unwrap_or(0);
        while cur != 0 {
            let Some(v) = self.get_version(cur) else {
                break;
            };
            let next = v.next_version().unwrap_or(0);
            out.push((cur, v));
            cur = next;
        }
        out
    }

    /// First version a snapshot is allowed to observe, newest to oldest.
    pub fn read(
        &self,
        row: RowKey,
        snapshot: &Snapshot,
        me: Txid,
        oracle: &VisibilityOracle<'_>,
    ) -> Option<Vec<u8>> {
        let mut cur = self.head_of(row).unwrap_or(0);
        while cur != 0 {
            let v = self.get_version(cur)?;
            if oracle.is_visible(&v, snapshot, me) {
                return Some(v.payload().to_vec());
            }
            cur = v.next_version().unwrap_or(0);
        }
        None
    }

    /// The version a writer operates against: the transaction's own
    /// uncommitted version if it has one, otherwise the newest version with
    /// a committed (or still-pending) creator. Versions from aborted
    /// creators are skipped.
    pub(crate) fn newest_qualifying(
        &self,
        row: RowKey,
        me: Txid,
        oracle: &VisibilityOracle<'_>,
    ) -> Option<(VersionId, Arc<TupleVersion>)> {
        let mut cur = self.head_of(row).unwrap_or(0);
        while cur != 0 {
            let v = self.get_version(cur)?;
            if v.created_by() == me {
                return Some((cur, v));
            }
            match oracle.creator_outcome(&v) {
                CreatorOutcome::Committed | CreatorOutcome::Pending => return Some((cur, v)),
                CreatorOutcome::Aborted => {
                    cur = v.next_version().unwrap_or(0);
                }
            }
        }
        None
    }

    /// Stamp `me` as the deleter of `version`. An aborted prior deleter is
    /// overwritten; a committed one is a write/write conflict surfaced to
    /// the caller. The caller must hold the row's exclusive lock.
    pub(crate) fn set_deleted(
        &self,
        version: &TupleVersion,
        me: Txid,
        oracle: &VisibilityOracle<'_>,
    ) -> Result<(), SetDeletedError> {
        let unit = self.unit_state(self.unit_of(version.row_key()));
        unit.epoch.fetch_add(1, Ordering::AcqRel);
        unit.all_visible.store(false, Ordering::Release);
        let result = Self::stamp_deleter(version, me, oracle);
        unit.epoch.fetch_add(1, Ordering::AcqRel);
        result
    }

    fn stamp_deleter(
        version: &TupleVersion,
        me: Txid,
        oracle: &VisibilityOracle<'_>,
    ) -> Result<(), SetDeletedError> {
        let mut cur = version.deleted_by.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                match version.deleted_by.compare_exchange(
                    0,
                    me.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(()),
                    Err(actual) => cur = actual,
                }
                continue;
            }
            let deleter = Txid::from_raw(cur);
            if deleter == me {
                return Err(SetDeletedError::SelfDeleted);
            }
            match oracle.txid_status(deleter) {
                TxidStatus::Committed => {
                    return Err(SetDeletedError::AlreadyDeletedBy(deleter));
                }
                TxidStatus::Aborted => {
                    // Reclaim the stamp from the aborted deleter.
                    match version.deleted_by.compare_exchange(
                        cur,
                        me.raw(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Ok(()),
                        Err(actual) => cur = actual,
                    }
                }
                TxidStatus::InProgress | TxidStatus::Unknown => {
                    return Err(SetDeletedError::PendingDeleter(deleter));
                }
            }
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }
}

#[cfg(test)]
mod tests {
    use mvheap_txn::TxidAllocator;

    use super::*;

    fn committed_write(
        store: &VersionStore,
        alloc: &TxidAllocator,
        row: RowKey,
        payload: &[u8],
    ) -> Txid {
        let txid = alloc.allocate().unwrap();
        store.insert(row, payload.to_vec(), txid);
        alloc.mark_committed(txid).unwrap();
        txid
    }

    fn snapshot_now(alloc: &TxidAllocator) -> Snapshot {
        let next = alloc.peek_next();
        Snapshot::new(next, next, vec![])
    }

    #[test]
    fn test_insert_links_chain_newest_first() {
        let alloc = TxidAllocator::new();
        let store = VersionStore::new(64);

        committed_write(&store, &alloc, 7, b"v1");
        committed_write(&store, &alloc, 7, b"v2");

        let chain = store.chain(7);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].1.payload(), b"v2");
        assert_eq!(chain[1].1.payload(), b"v1");
        assert_eq!(chain[0].1.next_version(), Some(chain[1].0));
    }

    #[test]
    fn test_read_returns_first_visible() {
        let alloc = TxidAllocator::new();
        let store = VersionStore::new(64);

        committed_write(&store, &alloc, 3, b"old");
        let snap_between = snapshot_now(&alloc);
        committed_write(&store, &alloc, 3, b"new");

        let oracle = VisibilityOracle::new(&alloc);
        let reader = alloc.allocate().unwrap();
        assert_eq!(
            store.read(3, &snap_between, reader, &oracle),
            Some(b"old".to_vec())
        );
        assert_eq!(
            store.read(3, &snapshot_now(&alloc), reader, &oracle),
            Some(b"new".to_vec())
        );
    }

    #[test]
    fn test_set_deleted_rejects_committed_deleter() {
        let alloc = TxidAllocator::new();
        let store = VersionStore::new(64);
        let oracle = VisibilityOracle::new(&alloc);

        committed_write(&store, &alloc, 1, b"x");
        let (_, head) = store
            .newest_qualifying(1, Txid::from_raw(0), &oracle)
            .unwrap();

        let d1 = alloc.allocate().unwrap();
        store.set_deleted(&head, d1, &oracle).unwrap();
        alloc.mark_committed(d1).unwrap();

        let d2 = alloc.allocate().unwrap();
        assert!(matches!(
            store.set_deleted(&head, d2, &oracle),
            Err(SetDeletedError::AlreadyDeletedBy(t)) if t == d1
        ));
    }

    #[test]
    fn test_set_deleted_overwrites_aborted_deleter() {
        let alloc = TxidAllocator::new();
        let store = VersionStore::new(64);
        let oracle = VisibilityOracle::new(&alloc);

        committed_write(&store, &alloc, 1, b"x");
        let (_, head) = store
            .newest_qualifying(1, Txid::from_raw(0), &oracle)
            .unwrap();

        let d1 = alloc.allocate().unwrap();
        store.set_deleted(&head, d1, &oracle).unwrap();
        alloc.mark_aborted(d1).unwrap();

        let d2 = alloc.allocate().unwrap();
        store.set_deleted(&head, d2, &oracle).unwrap();
        assert_eq!(head.deleted_by(), Some(d2));
    }

    #[test]
    fn test_newest_qualifying_skips_aborted_creators() {
        let alloc = TxidAllocator::new();
        let store = VersionStore::new(64);
        let oracle = VisibilityOracle::new(&alloc);

        committed_write(&store, &alloc, 9, b"keep");
        let aborted = alloc.allocate().unwrap();
        store.insert(9, b"gone".to_vec(), aborted);
        alloc.mark_aborted(aborted).unwrap();

        let me = alloc.allocate().unwrap();
        let (_, v) = store.newest_qualifying(9, me, &oracle).unwrap();
        assert_eq!(v.payload(), b"keep");
    }

    #[test]
    fn test_mutation_clears_all_visible_and_bumps_epoch() {
        let alloc = TxidAllocator::new();
        let store = VersionStore::new(64);

        let unit = store.unit_of(5);
        let state = store.unit_state(unit);
        state.all_visible.store(true, Ordering::Release);
        let before = state.epoch.load(Ordering::Acquire);

        committed_write(&store, &alloc, 5, b"x");
        assert!(!store.unit_all_visible(unit));
        assert_eq!(state.epoch.load(Ordering::Acquire), before + 2);
    }
}
