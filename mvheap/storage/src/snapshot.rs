//! Registry of live snapshots.
//!
//! Every snapshot handed to a transaction (or statement) is registered
//! here so the reclaimer can compute `global_xmin`, the oldest txid any
//! live snapshot can still reference. Registration keys are ordered by
//! `xmin`, making the horizon a `front()` lookup.
//!
//! A handle must be released exactly once. A handle that is never released
//! permanently pins the horizon; that hazard is surfaced through
//! [`SnapshotGauge`] and a log warning rather than silently ignored.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_skiplist::SkipMap;
use mvheap_txn::{Snapshot, Txid};
use serde::Serialize;

/// A registered snapshot. Releasing consumes the handle, which is what
/// enforces the exactly-once discipline at compile time.
pub struct SnapshotHandle {
    snapshot: Snapshot,
    key: (u64, u64),
}

impl SnapshotHandle {
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

/// Introspection counters for the snapshot registry. A stuck `oldest_xmin`
/// while `taken` keeps advancing is the signature of a leaked snapshot
/// pinning the reclamation horizon.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotGauge {
    pub live: usize,
    pub oldest_xmin: Option<Txid>,
    pub oldest_owner: Option<Txid>,
    pub taken: u64,
    pub released: u64,
}

pub struct SnapshotRegistry {
    live: SkipMap<(u64, u64), Txid>,
    serial: AtomicU64,
    taken: AtomicU64,
    released: AtomicU64,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self {
            live: SkipMap::new(),
            serial: AtomicU64::new(0),
            taken: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn register(&self, snapshot: Snapshot, owner: Txid) -> SnapshotHandle {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        let key = (snapshot.xmin().raw(), serial);
        self.live.insert(key, owner);
        self.taken.fetch_add(1, Ordering::Relaxed);
        SnapshotHandle { snapshot, key }
    }

    pub fn release(&self, handle: SnapshotHandle) {
        let removed = self.live.remove(&handle.key).is_some();
        debug_assert!(removed, "snapshot released twice");
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Oldest `xmin` among live snapshots, if any.
    pub fn oldest_xmin(&self) -> Option<Txid> {
        self.live.front().map(|e| Txid::from_raw(e.key().0))
    }

    pub fn gauge(&self) -> SnapshotGauge {
        let front = self.live.front();
        SnapshotGauge {
            live: self.live.len(),
            oldest_xmin: front.as_ref().map(|e| Txid::from_raw(e.key().0)),
            oldest_owner: front.as_ref().map(|e| *e.value()),
            taken: self.taken.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

impl Default for SnapshotRegistry {
    fn default() -> Self {
        Self::new()
    }
}
