//! Transaction handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use dashmap::DashSet;
use mvheap_txn::{IsolationLevel, Snapshot, Transaction, Txid, TxnState};
use parking_lot::Mutex;

use crate::engine::Engine;
use crate::error::{StorageError, StorageResult, TransactionError};
use crate::heap::RowKey;
use crate::snapshot::SnapshotHandle;

const STATE_ACTIVE: u8 = 0;
const STATE_COMMITTED: u8 = 1;
const STATE_ABORTED: u8 = 2;

/// A transaction against a heap [`Engine`]. Handles are `Arc`-shared;
/// mutating operations go through the engine (`engine.write(&txn, ..)`),
/// while `commit`/`rollback` live here. Dropping a handle that was never
/// committed or rolled back rolls the transaction back.
pub struct HeapTransaction {
    engine: Arc<Engine>,

    txid: Txid,
    isolation: IsolationLevel,
    state: AtomicU8,

    /// Whole-transaction snapshot under RepeatableRead/Serializable;
    /// ReadCommitted takes per-statement snapshots instead.
    snapshot: Mutex<Option<SnapshotHandle>>,

    // ---- Serializable footprint ----
    pub(crate) read_set: DashSet<RowKey>,
    pub(crate) write_set: DashSet<RowKey>,

    /// Whether commit/rollback already ran, suppressing the Drop rollback.
    is_handled: AtomicBool,
}

impl HeapTransaction {
    pub(crate) fn new(engine: Arc<Engine>, txid: Txid, isolation: IsolationLevel) -> Self {
        Self {
            engine,
            txid,
            isolation,
            state: AtomicU8::new(STATE_ACTIVE),
            snapshot: Mutex::new(None),
            read_set: DashSet::new(),
            write_set: DashSet::new(),
            is_handled: AtomicBool::new(false),
        }
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn state(&self) -> TxnState {
        match self.state.load(Ordering::Acquire) {
            STATE_ACTIVE => TxnState::Active,
            STATE_COMMITTED => TxnState::Committed,
            _ => TxnState::Aborted,
        }
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        let raw = match state {
            TxnState::Active => STATE_ACTIVE,
            TxnState::Committed => STATE_COMMITTED,
            TxnState::Aborted => STATE_ABORTED,
        };
        self.state.store(raw, Ordering::Release);
    }

    pub(crate) fn ensure_active(&self) -> StorageResult<()> {
        match self.state() {
            TxnState::Active => Ok(()),
            state => Err(TransactionError::InvalidStateTransition(format!(
                "transaction {} is {state:?}",
                self.txid
            ))
            .into()),
        }
    }

    pub(crate) fn install_snapshot(&self, handle: SnapshotHandle) {
        *self.snapshot.lock() = Some(handle);
    }

    pub(crate) fn snapshot_clone(&self) -> Option<Snapshot> {
        self.snapshot.lock().as_ref().map(|h| h.snapshot().clone())
    }

    pub(crate) fn take_snapshot_handle(&self) -> Option<SnapshotHandle> {
        self.snapshot.lock().take()
    }

    pub(crate) fn mark_handled(&self) {
        self.is_handled.store(true, Ordering::Release);
    }

    pub(crate) fn sorted_reads(&self) -> Vec<RowKey> {
        let mut rows: Vec<RowKey> = self.read_set.iter().map(|r| *r).collect();
        rows.sort_unstable();
        rows
    }

    pub(crate) fn sorted_writes(&self) -> Vec<RowKey> {
        let mut rows: Vec<RowKey> = self.write_set.iter().map(|r| *r).collect();
        rows.sort_unstable();
        rows
    }

    pub fn commit(&self) -> StorageResult<()> {
        self.engine.commit_txn(self)
    }

    pub fn rollback(&self) -> StorageResult<()> {
        self.engine.rollback_txn(self)
    }
}

impl Transaction for HeapTransaction {
    type Error = StorageError;

    fn txid(&self) -> Txid {
        self.txid
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    fn state(&self) -> TxnState {
        HeapTransaction::state(self)
    }

    fn commit(&self) -> Result<(), Self::Error> {
        HeapTransaction::commit(self)
    }

    fn rollback(&self) -> Result<(), Self::Error> {
        HeapTransaction::rollback(self)
    }
}

impl Drop for HeapTransaction {
    fn drop(&mut self) {
        // Roll back transactions abandoned without an explicit commit or
        // rollback. Errors are ignored: this is last-resort cleanup.
        if !self.is_handled.load(Ordering::Acquire) {
            let _ = self.engine.rollback_txn(self);
        }
    }
}

impl std::fmt::Debug for HeapTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapTransaction")
            .field("txid", &self.txid)
            .field("isolation", &self.isolation)
            .field("state", &self.state())
            .finish()
    }
}
