//! Reclaimer: removes tuple versions no snapshot can reference.
//!
//! A vacuum pass computes `global_xmin`, sweeps every row's version chain
//! one storage unit at a time, and unlinks versions that are dead to every
//! present and future snapshot: versions from aborted creators, and
//! versions whose deletion committed below the horizon. Unlinked versions
//! go to a graveyard freed on the *next* run, giving in-flight lock-free
//! chain walks a grace period.
//!
//! Surviving versions whose creator committed below the horizon are
//! frozen, which lets the txid status table be truncated. Units left with
//! only single frozen undeleted versions are marked all-visible, the
//! index-only-scan eligibility marker.
//!
//! The sweep holds only a per-unit scan mutex, released between units; it
//! never takes row locks and never blocks readers or writers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use dashmap::mapref::entry::Entry;
use mvheap_txn::{Txid, TxidStatus};
use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::heap::{RowKey, TupleVersion, UnitId, VersionId};
use crate::visibility::{CreatorOutcome, VisibilityOracle};

/// Warn when the reclamation horizon trails allocation by this many txids:
/// the signature of a leaked or very long-lived snapshot.
const HORIZON_PIN_WARN: u64 = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimStats {
    pub versions_removed: u64,
    pub units_marked_all_visible: u64,
}

struct RowSweep {
    removed: u64,
    live: bool,
    all_visible: bool,
}

impl Engine {
    /// Run one vacuum pass. Idempotent: a second pass with no intervening
    /// writes removes nothing and marks nothing new.
    pub fn vacuum(&self) -> ReclaimStats {
        let _serial = self.vacuum_serial.lock();

        // Free what the previous pass unlinked.
        let buried: Vec<VersionId> = std::mem::take(&mut *self.graveyard.lock());
        for vid in &buried {
            self.heap.versions.remove(vid);
        }

        let global_xmin = self.global_xmin();
        let mut stats = ReclaimStats::default();
        let mut min_referenced = u64::MAX;
        let mut newly_buried: Vec<VersionId> = Vec::new();

        let mut units: BTreeMap<UnitId, Vec<RowKey>> = BTreeMap::new();
        for entry in self.heap.rows.iter() {
            units
                .entry(self.heap.unit_of(*entry.key()))
                .or_default()
                .push(*entry.key());
        }

        for (unit, mut row_keys) in units {
            row_keys.sort_unstable();
            let unit_state = self.heap.unit_state(unit);
            let _scan = unit_state.scan_lock.lock();
            let epoch_before = unit_state.epoch.load(Ordering::Acquire);
            let mut all_visible = epoch_before % 2 == 0;
            let mut live_rows = 0usize;

            for row in row_keys {
                let sweep =
                    self.sweep_row(row, global_xmin, &mut newly_buried, &mut min_referenced);
                stats.versions_removed += sweep.removed;
                if sweep.live {
                    live_rows += 1;
                }
                all_visible &= sweep.all_visible;
            }

            // Seqlock validation: only mark the unit if no writer touched
            // it during the sweep.
            if all_visible
                && live_rows > 0
                && unit_state.epoch.load(Ordering::Acquire) == epoch_before
                && !unit_state.all_visible.swap(true, Ordering::AcqRel)
            {
                stats.units_marked_all_visible += 1;
            }
        }

        self.graveyard.lock().extend(newly_buried);

        // Bound the status table: everything below the horizon is either
        // unreachable or resolvable through hint flags on its versions.
        let prune_horizon = Txid::from_raw(min_referenced.min(global_xmin.raw()));
        let status_pruned = self.txns.allocator.truncate_below(prune_horizon);
        let footprints_pruned = self.conflicts.prune_below(global_xmin);

        if let Some(oldest) = self.snapshots.oldest_xmin() {
            let lag = self
                .txns
                .allocator
                .peek_next()
                .raw()
                .saturating_sub(oldest.raw());
            if lag > HORIZON_PIN_WARN {
                warn!(
                    oldest_xmin = %oldest,
                    lag,
                    "an old snapshot is pinning the reclamation horizon"
                );
            }
        }

        debug!(
            versions_removed = stats.versions_removed,
            units_marked = stats.units_marked_all_visible,
            status_pruned,
            footprints_pruned,
            %global_xmin,
            "vacuum pass finished"
        );
        stats
    }

    /// Sweep one row's chain under its map entry guard, so relinking
    /// cannot race a writer publishing a new head.
    fn sweep_row(
        &self,
        row: RowKey,
        global_xmin: Txid,
        newly_buried: &mut Vec<VersionId>,
        min_referenced: &mut u64,
    ) -> RowSweep {
        let empty = RowSweep {
            removed: 0,
            live: false,
            all_visible: true,
        };
        let Entry::Occupied(slot) = self.heap.rows.entry(row) else {
            return empty;
        };

        let mut chain: Vec<(VersionId, Arc<TupleVersion>)> = Vec::new();
        let mut cur = slot.get().head.load(Ordering::Acquire);
        while cur != 0 {
            let Some(version) = self.heap.get_version(cur) else {
                break;
            };
            let next = version.next_version().unwrap_or(0);
            chain.push((cur, version));
            cur = next;
        }

        let oracle = VisibilityOracle::new(&self.txns.allocator);
        let mut kept: Vec<(VersionId, Arc<TupleVersion>)> = Vec::new();
        let mut removed = 0u64;
        for (vid, version) in chain {
            let dead = match oracle.creator_outcome(&version) {
                CreatorOutcome::Aborted => true,
                CreatorOutcome::Pending => false,
                CreatorOutcome::Committed => match version.deleted_by() {
                    Some(d) => {
                        oracle.txid_status(d) == TxidStatus::Committed && d < global_xmin
                    }
                    None => false,
                },
            };
            if dead {
                newly_buried.push(vid);
                removed += 1;
            } else {
                kept.push((vid, version));
            }
        }

        // Relink survivors, newest first.
        for i in 0..kept.len() {
            let next = kept.get(i + 1).map(|(vid, _)| *vid);
            kept[i].1.set_next(next);
        }
        match kept.first() {
            Some((vid, _)) => slot.get().head.store(*vid, Ordering::Release),
            None => {
                slot.remove();
            }
        }

        let mut all_visible = kept.len() <= 1;
        for (_, version) in &kept {
            if oracle.creator_outcome(version) == CreatorOutcome::Committed
                && version.created_by() < global_xmin
            {
                version.mark_frozen();
            }
            if !version.is_frozen() {
                *min_referenced = (*min_referenced).min(version.created_by().raw());
                all_visible = false;
            }
            if let Some(d) = version.deleted_by() {
                if oracle.txid_status(d) == TxidStatus::Aborted {
                    version.clear_deleted(d);
                }
            }
            if let Some(d) = version.deleted_by() {
                *min_referenced = (*min_referenced).min(d.raw());
                all_visible = false;
            }
        }

        RowSweep {
            removed,
            live: !kept.is_empty(),
            all_visible,
        }
    }
}
