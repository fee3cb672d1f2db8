//! Commit-time dependency validation for Serializable transactions.
//!
//! Plain write/write races are settled first-updater-wins at write time by
//! the row lock plus the snapshot staleness check. What remains is the
//! read/write anomaly family (write skew): transactions that each read
//! overlapping state and wrote disjoint state. The detector keeps, per
//! committed Serializable transaction, its snapshot and sorted read/write
//! row-sets, and at commit builds rw-antidependency edges between the
//! committing transaction and the committed transactions concurrent with
//! it. A cycle through the committing transaction means the resulting
//! history is non-serializable, and the later committer is aborted.

use std::sync::Arc;

use crossbeam_skiplist::SkipMap;
use mvheap_txn::{Snapshot, Txid};
use tracing::debug;

use crate::error::TransactionError;
use crate::heap::RowKey;

/// Footprint of a committed Serializable transaction, retained until no
/// active transaction can be concurrent with it.
pub(crate) struct CommittedTxn {
    txid: Txid,
    snapshot: Snapshot,
    read_set: Vec<RowKey>,
    write_set: Vec<RowKey>,
}

impl CommittedTxn {
    pub(crate) fn new(
        txid: Txid,
        snapshot: Snapshot,
        mut read_set: Vec<RowKey>,
        mut write_set: Vec<RowKey>,
    ) -> Self {
        read_set.sort_unstable();
        write_set.sort_unstable();
        Self {
            txid,
            snapshot,
            read_set,
            write_set,
        }
    }
}

fn intersects(a: &[RowKey], b: &[RowKey]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => return true,
        }
    }
    false
}

pub(crate) struct ConflictDetector {
    committed: SkipMap<u64, Arc<CommittedTxn>>,
}

impl ConflictDetector {
    pub(crate) fn new() -> Self {
        Self {
            committed: SkipMap::new(),
        }
    }

    /// Committed transactions concurrent with `snapshot`: those in its
    /// in-progress set plus everything that began at or after its `xmax`.
    fn concurrent_with(&self, snapshot: &Snapshot) -> Vec<Arc<CommittedTxn>> {
        let mut out = Vec::new();
        for id in snapshot.in_progress() {
            if let Some(entry) = self.committed.get(&id.raw()) {
                out.push(entry.value().clone());
            }
        }
        for entry in self.committed.range(snapshot.xmax().raw()..) {
            out.push(entry.value().clone());
        }
        out
    }

    /// Validate the committing transaction against the retained history.
    /// `reads`/`writes` need not be sorted.
    pub(crate) fn validate(
        &self,
        txid: Txid,
        snapshot: &Snapshot,
        mut reads: Vec<RowKey>,
        mut writes: Vec<RowKey>,
    ) -> Result<(), TransactionError> {
        reads.sort_unstable();
        writes.sort_unstable();

        let concurrent = self.concurrent_with(snapshot);
        if concurrent.is_empty() {
            return Ok(());
        }

        // Node 0 is the committing transaction; nodes 1.. are the
        // concurrent committed ones. Edge A -> B: A read a row that B
        // wrote, and B's commit is invisible to A (a rw-antidependency).
        let n = concurrent.len() + 1;
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (bi, b) in concurrent.iter().enumerate() {
            if intersects(&reads, &b.write_set) {
                edges[0].push(bi + 1);
            }
            // The committing transaction's writes were invisible to every
            // already-committed transaction.
            if intersects(&b.read_set, &writes) {
                edges[bi + 1].push(0);
            }
        }
        for (ai, a) in concurrent.iter().enumerate() {
            for (bi, b) in concurrent.iter().enumerate() {
                if ai != bi
                    && !a.snapshot.sees(b.txid)
                    && intersects(&a.read_set, &b.write_set)
                {
                    edges[ai + 1].push(bi + 1);
                }
            }
        }

        if Self::cycle_through(&edges, 0) {
            debug!(%txid, "serialization cycle detected at commit");
            return Err(TransactionError::SerializationFailure(format!(
                "transaction {txid} is part of a read/write dependency cycle"
            )));
        }
        Ok(())
    }

    fn cycle_through(edges: &[Vec<usize>], start: usize) -> bool {
        let mut stack: Vec<usize> = edges[start].clone();
        let mut seen = vec![false; edges.len()];
        while let Some(node) = stack.pop() {
            if node == start {
                return true;
            }
            if seen[node] {
                continue;
            }
            seen[node] = true;
            stack.extend(edges[node].iter().copied());
        }
        false
    }

    /// Retain the footprint of a transaction that just committed.
    pub(crate) fn record_commit(&self, info: CommittedTxn) {
        self.committed.insert(info.txid.raw(), Arc::new(info));
    }

    /// Drop footprints no active or future transaction can be concurrent
    /// with. Returns the number of entries removed.
    pub(crate) fn prune_below(&self, horizon: Txid) -> usize {
        let mut removed = 0;
        for entry in self.committed.range(..horizon.raw()) {
            if entry.remove() {
                removed += 1;
            }
        }
        removed
    }

    pub(crate) fn retained(&self) -> usize {
        self.committed.len()
    }
}
