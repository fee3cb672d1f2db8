//! Point-in-time snapshots.
//!
//! A snapshot captures the set of transaction-commit facts a reader is
//! allowed to observe: everything that committed before `xmin` is settled
//! history, everything at or above `xmax` is the future, and the ids in
//! `in_progress` were concurrently active when the snapshot was taken.
//! Snapshots are immutable once constructed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::txid::Txid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Oldest transaction still active when the snapshot was taken
    /// (including the snapshot's own transaction).
    xmin: Txid,
    /// The next id the allocator would hand out; everything at or above
    /// this is invisible.
    xmax: Txid,
    /// Ids active at snapshot time, excluding the snapshot's own
    /// transaction. Sorted ascending.
    in_progress: Arc<[Txid]>,
}

impl Snapshot {
    pub fn new(xmin: Txid, xmax: Txid, in_progress: Vec<Txid>) -> Self {
        debug_assert!(in_progress.is_sorted());
        Self {
            xmin,
            xmax,
            in_progress: in_progress.into(),
        }
    }

    pub fn xmin(&self) -> Txid {
        self.xmin
    }

    pub fn xmax(&self) -> Txid {
        self.xmax
    }

    pub fn in_progress(&self) -> &[Txid] {
        &self.in_progress
    }

    /// Whether `id` is within this snapshot's horizon: allocated before the
    /// snapshot was taken and not concurrently active. This is purely the
    /// snapshot-side half of visibility; whether the transaction actually
    /// committed is the visibility oracle's concern.
    pub fn sees(&self, id: Txid) -> bool {
        id < self.xmax && self.in_progress.binary_search(&id).is_err()
    }
}
