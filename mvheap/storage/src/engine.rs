//! The engine: composition root and transaction coordinator.
//!
//! An [`Engine`] is an explicitly owned context object. There is no
//! process-global state, so independent engines coexist in one process.
//! It sequences the version store, snapshot registry, lock manager and
//! conflict detector into the public begin/read/write/delete/commit/
//! rollback operations.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use mvheap_txn::{IsolationLevel, Snapshot, Txid, TxidStatus, TxnManager, TxnState};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::conflict::{CommittedTxn, ConflictDetector};
use crate::error::{RowError, StorageResult, TransactionError};
use crate::heap::{RowKey, SetDeletedError, TupleVersion, VersionId, VersionStore};
use crate::lock::{LockManager, LockMode, LockTableEntry, LockTarget};
use crate::snapshot::{SnapshotGauge, SnapshotHandle, SnapshotRegistry};
use crate::transaction::HeapTransaction;
use crate::txn_manager::TxnTable;
use crate::visibility::{CreatorOutcome, VisibilityOracle};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a lock request may wait before failing with
    /// `LockWaitTimeout`. `None` waits until granted or deadlock-aborted.
    pub lock_wait_timeout: Option<Duration>,
    /// Run a vacuum pass after this many finished transactions.
    /// `None` disables automatic vacuum.
    pub autovacuum_threshold: Option<u64>,
    /// Row keys per storage unit, the granularity of the all-visible
    /// marker.
    pub rows_per_unit: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout: None,
            autovacuum_threshold: Some(50),
            rows_per_unit: 64,
        }
    }
}

/// The `{xmin, xmax, in_progress}` view of a transaction's snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub xmin: Txid,
    pub xmax: Txid,
    pub in_progress: Vec<Txid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    pub active_transactions: usize,
    pub snapshots: SnapshotGauge,
    pub global_xmin: Txid,
    pub rows: usize,
    pub versions: usize,
    pub lock_targets: usize,
    pub lock_waiters: usize,
    pub retained_status_entries: usize,
    pub retained_committed_footprints: usize,
}

pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) heap: VersionStore,
    pub(crate) locks: LockManager,
    pub(crate) snapshots: SnapshotRegistry,
    pub(crate) conflicts: ConflictDetector,
    pub(crate) txns: TxnTable,
    /// Serializes commits so conflict validation sees a stable history.
    pub(crate) commit_serial: Mutex<()>,
    /// Versions unlinked by the previous vacuum run, freed by the next.
    pub(crate) graveyard: Mutex<Vec<VersionId>>,
    pub(crate) vacuum_serial: Mutex<()>,
}

impl Engine {
    pub fn new() -> Arc<Self> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Arc<Self> {
        let rows_per_unit = config.rows_per_unit;
        Arc::new(Self {
            config,
            heap: VersionStore::new(rows_per_unit),
            locks: LockManager::new(),
            snapshots: SnapshotRegistry::new(),
            conflicts: ConflictDetector::new(),
            txns: TxnTable::new(),
            commit_serial: Mutex::new(()),
            graveyard: Mutex::new(Vec::new()),
            vacuum_serial: Mutex::new(()),
        })
    }

    /// Begin a transaction. Repeatable-Read and Serializable transactions
    /// take their whole-transaction snapshot here.
    pub fn begin(
        self: &Arc<Self>,
        isolation: IsolationLevel,
    ) -> StorageResult<Arc<HeapTransaction>> {
        let txn = {
            let _latch = self.txns.latch.write();
            let txid = self.txns.allocator.allocate()?;
            let txn = Arc::new(HeapTransaction::new(self.clone(), txid, isolation));
            self.txns.active.insert(txid.raw(), Arc::downgrade(&txn));
            txn
        };
        if !isolation.statement_snapshot() {
            let snapshot = self.txns.capture_snapshot(txn.txid());
            txn.install_snapshot(self.snapshots.register(snapshot, txn.txid()));
        }
        Ok(txn)
    }

    /// Read `row` through the transaction's snapshot. Never blocks and
    /// never takes locks.
    pub fn read(&self, txn: &HeapTransaction, row: RowKey) -> StorageResult<Option<Vec<u8>>> {
        txn.ensure_active()?;
        let stmt = self.statement_snapshot(txn)?;
        let oracle = VisibilityOracle::new(&self.txns.allocator);
        let result = self.heap.read(row, stmt.snapshot(), txn.txid(), &oracle);
        if txn.isolation_level().is_serializable() {
            txn.read_set.insert(row);
        }
        Ok(result)
    }

    /// Write `row`: an update of the newest committed version when the row
    /// exists, an insert otherwise. Updates are delete-then-insert,
    /// producing two linked versions.
    pub fn write(
        &self,
        txn: &HeapTransaction,
        row: RowKey,
        payload: Vec<u8>,
    ) -> StorageResult<()> {
        txn.ensure_active()?;
        self.locks
            .acquire(LockTarget::Row(row), txn.txid(), LockMode::Exclusive)?
            .wait(self.config.lock_wait_timeout)?;
        let stmt = self.statement_snapshot(txn)?;
        let oracle = VisibilityOracle::new(&self.txns.allocator);
        debug_assert!(
            self.locks
                .holds(txn.txid(), LockTarget::Row(row), LockMode::Exclusive)
        );

        if let Some((_, version)) = self.heap.newest_qualifying(row, txn.txid(), &oracle) {
            self.supersede(txn, row, &version, stmt.snapshot(), &oracle, true)?;
        }
        self.heap.insert(row, payload, txn.txid());
        if txn.isolation_level().is_serializable() {
            txn.write_set.insert(row);
        }
        Ok(())
    }

    /// Delete `row` as seen by the transaction.
    pub fn delete(&self, txn: &HeapTransaction, row: RowKey) -> StorageResult<()> {
        txn.ensure_active()?;
        self.locks
            .acquire(LockTarget::Row(row), txn.txid(), LockMode::Exclusive)?
            .wait(self.config.lock_wait_timeout)?;
        let stmt = self.statement_snapshot(txn)?;
        let oracle = VisibilityOracle::new(&self.txns.allocator);
        debug_assert!(
            self.locks
                .holds(txn.txid(), LockTarget::Row(row), LockMode::Exclusive)
        );

        let Some((_, version)) = self.heap.newest_qualifying(row, txn.txid(), &oracle) else {
            return Err(RowError::RowNotFound(row).into());
        };
        self.supersede(txn, row, &version, stmt.snapshot(), &oracle, false)?;
        if txn.isolation_level().is_serializable() {
            txn.write_set.insert(row);
        }
        Ok(())
    }

    /// Stamp the delete on the version a write or delete supersedes,
    /// enforcing first-updater-wins under snapshot-stable isolation.
    ///
    /// For a write (`upsert`), a row whose deletion is already settled and
    /// visible simply gets a fresh version; for a delete it is
    /// `RowNotFound`.
    fn supersede(
        &self,
        txn: &HeapTransaction,
        row: RowKey,
        version: &TupleVersion,
        snapshot: &Snapshot,
        oracle: &VisibilityOracle<'_>,
        upsert: bool,
    ) -> StorageResult<()> {
        let me = txn.txid();

        if version.created_by() == me {
            // Superseding our own uncommitted version.
            if version.deleted_by() == Some(me) {
                return if upsert {
                    Ok(())
                } else {
                    Err(RowError::RowNotFound(row).into())
                };
            }
            return self.stamp_delete(row, version, me, oracle);
        }

        if oracle.creator_outcome(version) == CreatorOutcome::Pending {
            // Cannot happen while we hold the row's exclusive lock.
            return Err(TransactionError::WriteConflict(format!(
                "row {row} has an uncommitted version from transaction {}",
                version.created_by()
            ))
            .into());
        }

        // The newest committed version. Resolve its deletion state first.
        if let Some(deleter) = version.deleted_by() {
            if deleter == me {
                // We already deleted this row earlier in the transaction.
                return if upsert {
                    Ok(())
                } else {
                    Err(RowError::RowNotFound(row).into())
                };
            }
            match oracle.txid_status(deleter) {
                TxidStatus::Committed => {
                    return if snapshot.sees(deleter)
                        || txn.isolation_level().statement_snapshot()
                    {
                        // The row is gone in the state we operate against.
                        if upsert {
                            Ok(())
                        } else {
                            Err(RowError::RowNotFound(row).into())
                        }
                    } else {
                        Err(TransactionError::WriteConflict(format!(
                            "row {row} was deleted by concurrent transaction {deleter}"
                        ))
                        .into())
                    };
                }
                TxidStatus::Aborted => {
                    // Stale stamp; stamp_delete below reclaims it.
                }
                TxidStatus::InProgress | TxidStatus::Unknown => {
                    return Err(TransactionError::WriteConflict(format!(
                        "row {row} is being deleted by in-progress transaction {deleter}"
                    ))
                    .into());
                }
            }
        }

        // First-updater-wins: under a transaction-lifetime snapshot, the
        // newest committed version must be the one our snapshot sees.
        if !txn.isolation_level().statement_snapshot()
            && !oracle.is_visible(version, snapshot, me)
        {
            return Err(TransactionError::WriteConflict(format!(
                "row {row} was modified by a transaction concurrent with {me}"
            ))
            .into());
        }

        self.stamp_delete(row, version, me, oracle)
    }

    fn stamp_delete(
        &self,
        row: RowKey,
        version: &TupleVersion,
        me: Txid,
        oracle: &VisibilityOracle<'_>,
    ) -> StorageResult<()> {
        match self.heap.set_deleted(version, me, oracle) {
            Ok(()) => Ok(()),
            Err(SetDeletedError::SelfDeleted) => Ok(()),
            Err(SetDeletedError::AlreadyDeletedBy(by)) => Err(TransactionError::WriteConflict(
                format!("row {row} already deleted by committed transaction {by}"),
            )
            .into()),
            Err(SetDeletedError::PendingDeleter(by)) => Err(TransactionError::WriteConflict(
                format!("row {row} is being deleted by in-progress transaction {by}"),
            )
            .into()),
        }
    }

    /// Explicit row lock, the `SELECT ... FOR UPDATE / FOR SHARE`
    /// equivalent.
    pub fn lock_row(
        &self,
        txn: &HeapTransaction,
        row: RowKey,
        mode: LockMode,
    ) -> StorageResult<()> {
        txn.ensure_active()?;
        self.locks
            .acquire(LockTarget::Row(row), txn.txid(), mode)?
            .wait(self.config.lock_wait_timeout)
    }

    /// Transaction-scoped advisory lock on an application-defined key.
    pub fn advisory_lock(
        &self,
        txn: &HeapTransaction,
        key: u64,
        mode: LockMode,
    ) -> StorageResult<()> {
        txn.ensure_active()?;
        self.locks
            .acquire(LockTarget::Advisory(key), txn.txid(), mode)?
            .wait(self.config.lock_wait_timeout)
    }

    /// Non-blocking advisory lock attempt.
    pub fn try_advisory_lock(
        &self,
        txn: &HeapTransaction,
        key: u64,
        mode: LockMode,
    ) -> StorageResult<bool> {
        txn.ensure_active()?;
        Ok(self
            .locks
            .try_acquire(LockTarget::Advisory(key), txn.txid(), mode))
    }

    pub(crate) fn commit_txn(&self, txn: &HeapTransaction) -> StorageResult<()> {
        txn.ensure_active()?;
        let txid = txn.txid();
        let serial = self.commit_serial.lock();

        if txn.isolation_level().is_serializable() {
            if let Some(snapshot) = txn.snapshot_clone() {
                if let Err(err) = self.conflicts.validate(
                    txid,
                    &snapshot,
                    txn.sorted_reads(),
                    txn.sorted_writes(),
                ) {
                    drop(serial);
                    self.rollback_txn(txn)?;
                    return Err(err.into());
                }
            }
        }

        {
            // Commit visibility is this single transition: once the status
            // flips and the id leaves the active set, every later snapshot
            // observes the commit.
            let _latch = self.txns.latch.write();
            self.txns.allocator.mark_committed(txid)?;
            self.txns.active.remove(&txid.raw());
        }

        if txn.isolation_level().is_serializable() {
            if let Some(snapshot) = txn.snapshot_clone() {
                self.conflicts.record_commit(CommittedTxn::new(
                    txid,
                    snapshot,
                    txn.sorted_reads(),
                    txn.sorted_writes(),
                ));
            }
        }

        self.locks.release_all(txid);
        if let Some(handle) = txn.take_snapshot_handle() {
            self.snapshots.release(handle);
        }
        txn.set_state(TxnState::Committed);
        txn.mark_handled();
        drop(serial);

        debug!(%txid, "committed");
        self.maybe_autovacuum();
        Ok(())
    }

    pub(crate) fn rollback_txn(&self, txn: &HeapTransaction) -> StorageResult<()> {
        match txn.state() {
            // Rollback is retryable: rolling back twice is a no-op.
            TxnState::Aborted => return Ok(()),
            TxnState::Committed => {
                return Err(TransactionError::InvalidStateTransition(format!(
                    "transaction {} already committed",
                    txn.txid()
                ))
                .into());
            }
            TxnState::Active => {}
        }
        let txid = txn.txid();
        {
            let _latch = self.txns.latch.write();
            self.txns.allocator.mark_aborted(txid)?;
            self.txns.active.remove(&txid.raw());
        }
        self.locks.release_all(txid);
        if let Some(handle) = txn.take_snapshot_handle() {
            self.snapshots.release(handle);
        }
        txn.set_state(TxnState::Aborted);
        txn.mark_handled();

        debug!(%txid, "rolled back");
        self.maybe_autovacuum();
        Ok(())
    }

    /// The transaction's snapshot as `{xmin, xmax, in_progress}`. A
    /// Read-Committed transaction between statements reports the snapshot
    /// its next statement would take.
    pub fn snapshot_of(&self, txn: &HeapTransaction) -> StorageResult<SnapshotInfo> {
        txn.ensure_active()?;
        let snapshot = match txn.snapshot_clone() {
            Some(snapshot) => snapshot,
            None => self.txns.capture_snapshot(txn.txid()),
        };
        Ok(SnapshotInfo {
            xmin: snapshot.xmin(),
            xmax: snapshot.xmax(),
            in_progress: snapshot.in_progress().to_vec(),
        })
    }

    /// Oldest txid any live or future snapshot can reference; the vacuum
    /// horizon.
    pub fn global_xmin(&self) -> Txid {
        let mut horizon = self.txns.allocator.peek_next();
        if let Some(oldest) = self.txns.oldest_active() {
            horizon = horizon.min(oldest);
        }
        if let Some(oldest) = self.snapshots.oldest_xmin() {
            horizon = horizon.min(oldest);
        }
        horizon
    }

    pub fn lock_table(&self) -> Vec<LockTableEntry> {
        self.locks.dump()
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            active_transactions: self.txns.active_count(),
            snapshots: self.snapshots.gauge(),
            global_xmin: self.global_xmin(),
            rows: self.heap.row_count(),
            versions: self.heap.version_count(),
            lock_targets: self.locks.target_count(),
            lock_waiters: self.locks.waiter_count(),
            retained_status_entries: self.txns.allocator.retained(),
            retained_committed_footprints: self.conflicts.retained(),
        }
    }

    /// Whether the storage unit containing `row` is marked all-visible.
    pub fn unit_all_visible(&self, row: RowKey) -> bool {
        self.heap.unit_all_visible(self.heap.unit_of(row))
    }

    fn maybe_autovacuum(&self) {
        let Some(threshold) = self.config.autovacuum_threshold else {
            return;
        };
        let finished = self
            .txns
            .finished_since_vacuum
            .fetch_add(1, Ordering::SeqCst)
            + 1;
        if finished >= threshold {
            self.txns.finished_since_vacuum.store(0, Ordering::SeqCst);
            self.vacuum();
        }
    }

    fn statement_snapshot(&self, txn: &HeapTransaction) -> StorageResult<StatementSnapshot<'_>> {
        if txn.isolation_level().statement_snapshot() {
            let snapshot = self.txns.capture_snapshot(txn.txid());
            let handle = self.snapshots.register(snapshot.clone(), txn.txid());
            Ok(StatementSnapshot {
                snapshot,
                fresh: Some((self, handle)),
            })
        } else {
            let snapshot = txn.snapshot_clone().ok_or_else(|| {
                TransactionError::InvalidStateTransition(format!(
                    "transaction {} has no snapshot",
                    txn.txid()
                ))
            })?;
            Ok(StatementSnapshot {
                snapshot,
                fresh: None,
            })
        }
    }
}

impl TxnManager for Arc<Engine> {
    type Transaction = HeapTransaction;
    type Error = crate::error::StorageError;

    fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Arc<Self::Transaction>, Self::Error> {
        Engine::begin(self, isolation)
    }

    fn global_xmin(&self) -> Txid {
        Engine::global_xmin(self)
    }
}

/// Snapshot scope of a single statement: borrowed for the transaction's
/// lifetime under RR/Serializable, freshly registered and released at
/// statement end under Read-Committed.
struct StatementSnapshot<'a> {
    snapshot: Snapshot,
    fresh: Option<(&'a Engine, SnapshotHandle)>,
}

impl StatementSnapshot<'_> {
    fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Drop for StatementSnapshot<'_> {
    fn drop(&mut self) {
        if let Some((engine, handle)) = self.fresh.take() {
            engine.snapshots.release(handle);
        }
    }
}
