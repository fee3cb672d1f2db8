//! Row-level and advisory lock manager.
//!
//! Locks are granted immediately when compatible with the current holders
//! and nothing is queued ahead; otherwise the requester joins a FIFO queue
//! and suspends. Suspension is a [`LockTicket`]: a blocking `wait` built on
//! a condvar that is also a cancellable `Future`, so cooperative schedulers
//! can await grants without dedicating a thread per waiter.
//!
//! Deadlocks are detected synchronously on wait-edge insertion (see
//! [`deadlock`]); the transaction whose edge closes the cycle is aborted
//! with `DeadlockDetected`.

pub mod deadlock;

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mvheap_txn::Txid;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::warn;

use crate::error::{StorageResult, TransactionError};
use crate::heap::RowKey;
use crate::lock::deadlock::WaitForGraph;

/// What a lock protects: a heap row, or a caller-defined advisory key
/// sharing the same queueing and deadlock machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LockTarget {
    Row(RowKey),
    Advisory(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn compatible(self, other: LockMode) -> bool {
        self == LockMode::Shared && other == LockMode::Shared
    }

    /// Whether holding `self` already satisfies a request for `req`.
    fn covers(self, req: LockMode) -> bool {
        self == LockMode::Exclusive || req == LockMode::Shared
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Waiting,
    Granted,
    Deadlocked,
    Cancelled,
}

struct Waiter {
    id: u64,
    txid: Txid,
    mode: LockMode,
    upgrade: bool,
    target: LockTarget,
    state: Mutex<WaitState>,
    cv: Condvar,
    waker: Mutex<Option<Waker>>,
}

impl Waiter {
    /// Settle the waiter once; later resolutions are ignored.
    fn resolve(&self, outcome: WaitState) {
        let mut st = self.state.lock();
        if *st == WaitState::Waiting {
            *st = outcome;
            self.cv.notify_all();
            if let Some(waker) = self.waker.lock().take() {
                waker.wake();
            }
        }
    }
}

#[derive(Default)]
struct LockState {
    holders: Vec<(Txid, LockMode)>,
    queue: VecDeque<Arc<Waiter>>,
}

impl LockState {
    fn holder_mode(&self, txid: Txid) -> Option<LockMode> {
        self.holders
            .iter()
            .find(|(t, _)| *t == txid)
            .map(|(_, m)| *m)
    }

    fn grantable(&self, mode: LockMode) -> bool {
        self.holders.iter().all(|(_, held)| held.compatible(mode))
    }
}

/// One row of the lock-table dump, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct LockTableEntry {
    pub target: LockTarget,
    pub holders: Vec<(Txid, LockMode)>,
    pub waiting: Vec<(Txid, LockMode)>,
}

pub struct LockManager {
    table: DashMap<LockTarget, LockState>,
    held: DashMap<Txid, HashSet<LockTarget>>,
    graph: Mutex<WaitForGraph>,
    next_waiter: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
            held: DashMap::new(),
            graph: Mutex::new(WaitForGraph::default()),
            next_waiter: AtomicU64::new(1),
        }
    }

    /// Request `mode` on `target` for `txid`. Returns a granted ticket, a
    /// pending ticket to `wait`/`await` on, or `DeadlockDetected` if the
    /// request would immediately close a wait-for cycle.
    pub fn acquire(
        &self,
        target: LockTarget,
        txid: Txid,
        mode: LockMode,
    ) -> StorageResult<LockTicket<'_>> {
        let mut entry = self.table.entry(target).or_default();
        let state = entry.value_mut();

        if let Some(held) = state.holder_mode(txid) {
            if held.covers(mode) {
                return Ok(LockTicket::granted(self));
            }
            // Shared -> Exclusive upgrade: in place when sole holder,
            // otherwise wait at the queue front for the others to drain.
            if state.holders.len() == 1 {
                state.holders[0].1 = LockMode::Exclusive;
                return Ok(LockTicket::granted(self));
            }
            let waiter = self.new_waiter(target, txid, LockMode::Exclusive, true);
            state.queue.push_front(waiter.clone());
            return self.begin_wait(entry, waiter);
        }

        // Immediate grant only when nothing is queued ahead, preserving
        // FIFO fairness for waiters.
        if state.queue.is_empty() && state.grantable(mode) {
            state.holders.push((txid, mode));
            self.note_held(txid, target);
            return Ok(LockTicket::granted(self));
        }

        let waiter = self.new_waiter(target, txid, mode, false);
        state.queue.push_back(waiter.clone());
        self.begin_wait(entry, waiter)
    }

    /// Non-blocking variant: grant immediately or report `false`.
    pub fn try_acquire(&self, target: LockTarget, txid: Txid, mode: LockMode) -> bool {
        let mut entry = self.table.entry(target).or_default();
        let state = entry.value_mut();
        if let Some(held) = state.holder_mode(txid) {
            if held.covers(mode) {
                return true;
            }
            if state.holders.len() == 1 {
                state.holders[0].1 = LockMode::Exclusive;
                return true;
            }
            return false;
        }
        if state.queue.is_empty() && state.grantable(mode) {
            state.holders.push((txid, mode));
            self.note_held(txid, target);
            return true;
        }
        false
    }

    /// Release every lock held by `txid` and hand the freed capacity to the
    /// next compatible waiters in FIFO order.
    pub fn release_all(&self, txid: Txid) {
        {
            self.graph.lock().clear_wait(txid);
        }
        let targets = self
            .held
            .remove(&txid)
            .map(|(_, set)| set)
            .unwrap_or_default();
        for target in targets {
            if let Some(mut entry) = self.table.get_mut(&target) {
                let state = entry.value_mut();
                state.holders.retain(|(t, _)| *t != txid);
                self.settle(state);
                let empty = state.holders.is_empty() && state.queue.is_empty();
                drop(entry);
                if empty {
                    self.table
                        .remove_if(&target, |_, s| s.holders.is_empty() && s.queue.is_empty());
                }
            }
        }
    }

    /// Whether `txid` holds `target` in a mode covering `mode`. Used as the
    /// assertion boundary by the heap mutation paths.
    pub fn holds(&self, txid: Txid, target: LockTarget, mode: LockMode) -> bool {
        self.table
            .get(&target)
            .and_then(|s| s.holder_mode(txid))
            .map(|held| held.covers(mode))
            .unwrap_or(false)
    }

    /// Current holders and waiters per target, the `pg_locks`-style view.
    pub fn dump(&self) -> Vec<LockTableEntry> {
        self.table
            .iter()
            .map(|entry| LockTableEntry {
                target: *entry.key(),
                holders: entry.holders.clone(),
                waiting: entry
                    .queue
                    .iter()
                    .filter(|w| *w.state.lock() == WaitState::Waiting)
                    .map(|w| (w.txid, w.mode))
                    .collect(),
            })
            .collect()
    }

    pub fn target_count(&self) -> usize {
        self.table.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.table
            .iter()
            .map(|e| {
                e.queue
                    .iter()
                    .filter(|w| *w.state.lock() == WaitState::Waiting)
                    .count()
            })
            .sum()
    }

    fn new_waiter(
        &self,
        target: LockTarget,
        txid: Txid,
        mode: LockMode,
        upgrade: bool,
    ) -> Arc<Waiter> {
        Arc::new(Waiter {
            id: self.next_waiter.fetch_add(1, Ordering::Relaxed),
            txid,
            mode,
            upgrade,
            target,
            state: Mutex::new(WaitState::Waiting),
            cv: Condvar::new(),
            waker: Mutex::new(None),
        })
    }

    fn note_held(&self, txid: Txid, target: LockTarget) {
        self.held.entry(txid).or_default().insert(target);
    }

    /// Register the waiter's wait-for edges; abort it on the spot if its
    /// own edge insertion closes a cycle.
    fn begin_wait(
        &self,
        mut entry: dashmap::mapref::one::RefMut<'_, LockTarget, LockState>,
        waiter: Arc<Waiter>,
    ) -> StorageResult<LockTicket<'_>> {
        let state = entry.value_mut();
        let holders: Vec<Txid> = state
            .holders
            .iter()
            .map(|(t, _)| *t)
            .filter(|t| *t != waiter.txid)
            .collect();
        let deadlocked = {
            let mut graph = self.graph.lock();
            graph.set_wait(waiter.txid, holders);
            if graph.on_cycle(waiter.txid) {
                graph.clear_wait(waiter.txid);
                true
            } else {
                false
            }
        };
        if deadlocked {
            state.queue.retain(|w| w.id != waiter.id);
            warn!(txid = %waiter.txid, target = ?waiter.target, "deadlock victim");
            return Err(TransactionError::DeadlockDetected(format!(
                "transaction {} would wait on a cycle for {:?}",
                waiter.txid, waiter.target
            ))
            .into());
        }
        drop(entry);
        Ok(LockTicket::waiting(self, waiter))
    }

    /// Grant as many queued waiters as compatibility allows, then refresh
    /// wait-for edges for the rest; repeat if a deadlock victim had to be
    /// removed.
    fn settle(&self, state: &mut LockState) {
        loop {
            self.grant_pass(state);
            let Some(victim) = self.edge_pass(state) else {
                break;
            };
            state.queue.retain(|w| w.id != victim.id);
            warn!(txid = %victim.txid, target = ?victim.target, "deadlock victim");
            victim.resolve(WaitState::Deadlocked);
        }
    }

    fn grant_pass(&self, state: &mut LockState) {
        // Drop settled waiters from the front.
        while let Some(front) = state.queue.front() {
            if *front.state.lock() == WaitState::Waiting {
                break;
            }
            state.queue.pop_front();
        }
        let Some(front) = state.queue.front() else {
            return;
        };
        match front.mode {
            LockMode::Exclusive => {
                let grantable = if front.upgrade {
                    state.holders.len() == 1 && state.holders[0].0 == front.txid
                } else {
                    state.holders.is_empty()
                };
                if !grantable {
                    return;
                }
                let waiter = state.queue.pop_front().expect("front exists");
                if waiter.upgrade {
                    state.holders[0].1 = LockMode::Exclusive;
                } else {
                    state.holders.push((waiter.txid, LockMode::Exclusive));
                    self.note_held(waiter.txid, waiter.target);
                }
                {
                    self.graph.lock().clear_wait(waiter.txid);
                }
                waiter.resolve(WaitState::Granted);
            }
            LockMode::Shared => {
                if !state.grantable(LockMode::Shared) {
                    return;
                }
                // Maximal leading run of shared waiters; ties between
                // simultaneously grantable requests go to the lower txid.
                let mut batch = Vec::new();
                while let Some(front) = state.queue.front() {
                    if *front.state.lock() != WaitState::Waiting {
                        state.queue.pop_front();
                        continue;
                    }
                    if front.mode != LockMode::Shared {
                        break;
                    }
                    batch.push(state.queue.pop_front().expect("front exists"));
                }
                batch.sort_by_key(|w| w.txid);
                for waiter in batch {
                    state.holders.push((waiter.txid, LockMode::Shared));
                    self.note_held(waiter.txid, waiter.target);
                    {
                        self.graph.lock().clear_wait(waiter.txid);
                    }
                    waiter.resolve(WaitState::Granted);
                }
            }
        }
    }

    fn edge_pass(&self, state: &LockState) -> Option<Arc<Waiter>> {
        let holders: Vec<Txid> = state.holders.iter().map(|(t, _)| *t).collect();
        let mut graph = self.graph.lock();
        for waiter in &state.queue {
            if *waiter.state.lock() != WaitState::Waiting {
                continue;
            }
            graph.set_wait(
                waiter.txid,
                holders.iter().copied().filter(|t| *t != waiter.txid),
            );
            if graph.on_cycle(waiter.txid) {
                graph.clear_wait(waiter.txid);
                return Some(waiter.clone());
            }
        }
        None
    }

    /// Dequeue a waiter that gave up (timeout or dropped ticket). Returns
    /// the final state observed, which may be `Granted` if the grant raced
    /// the cancellation.
    fn cancel(&self, waiter: &Arc<Waiter>) -> WaitState {
        if let Some(mut entry) = self.table.get_mut(&waiter.target) {
            let outcome = {
                let mut st = waiter.state.lock();
                if *st == WaitState::Waiting {
                    *st = WaitState::Cancelled;
                }
                *st
            };
            if outcome == WaitState::Cancelled {
                let state = entry.value_mut();
                state.queue.retain(|w| w.id != waiter.id);
                {
                    self.graph.lock().clear_wait(waiter.txid);
                }
                self.settle(state);
            }
            outcome
        } else {
            *waiter.state.lock()
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending or granted lock request. Block on it with [`wait`], or `await`
/// it; dropping a pending ticket cancels the request.
///
/// [`wait`]: LockTicket::wait
pub struct LockTicket<'a> {
    mgr: &'a LockManager,
    waiter: Option<Arc<Waiter>>,
}

impl<'a> LockTicket<'a> {
    fn granted(mgr: &'a LockManager) -> Self {
        Self { mgr, waiter: None }
    }

    fn waiting(mgr: &'a LockManager, waiter: Arc<Waiter>) -> Self {
        Self {
            mgr,
            waiter: Some(waiter),
        }
    }

    pub fn is_granted(&self) -> bool {
        match &self.waiter {
            None => true,
            Some(w) => *w.state.lock() == WaitState::Granted,
        }
    }

    /// Block until the lock is granted, the wait deadlocks, or `timeout`
    /// elapses.
    pub fn wait(mut self, timeout: Option<Duration>) -> StorageResult<()> {
        let Some(waiter) = self.waiter.take() else {
            return Ok(());
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = waiter.state.lock();
        loop {
            match *st {
                WaitState::Granted => return Ok(()),
                WaitState::Deadlocked => {
                    return Err(TransactionError::DeadlockDetected(format!(
                        "transaction {} aborted while waiting for {:?}",
                        waiter.txid, waiter.target
                    ))
                    .into());
                }
                WaitState::Cancelled => {
                    return Err(TransactionError::LockWaitTimeout(format!(
                        "wait for {:?} was cancelled",
                        waiter.target
                    ))
                    .into());
                }
                WaitState::Waiting => match deadline {
                    None => waiter.cv.wait(&mut st),
                    Some(d) => {
                        if waiter.cv.wait_until(&mut st, d).timed_out()
                            && *st == WaitState::Waiting
                        {
                            drop(st);
                            return match self.mgr.cancel(&waiter) {
                                WaitState::Granted => Ok(()),
                                _ => Err(TransactionError::LockWaitTimeout(format!(
                                    "timed out waiting for {:?}",
                                    waiter.target
                                ))
                                .into()),
                            };
                        }
                    }
                },
            }
        }
    }
}

impl Future for LockTicket<'_> {
    type Output = StorageResult<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(waiter) = this.waiter.as_ref() else {
            return Poll::Ready(Ok(()));
        };
        let mut st = waiter.state.lock();
        match *st {
            WaitState::Granted => {
                drop(st);
                this.waiter = None;
                Poll::Ready(Ok(()))
            }
            WaitState::Deadlocked => {
                let err = TransactionError::DeadlockDetected(format!(
                    "transaction {} aborted while waiting for {:?}",
                    waiter.txid, waiter.target
                ));
                drop(st);
                this.waiter = None;
                Poll::Ready(Err(err.into()))
            }
            WaitState::Cancelled => {
                let err = TransactionError::LockWaitTimeout(format!(
                    "wait for {:?} was cancelled",
                    waiter.target
                ));
                drop(st);
                this.waiter = None;
                Poll::Ready(Err(err.into()))
            }
            WaitState::Waiting => {
                *waiter.waker.lock() = Some(cx.waker().clone());
                drop(st);
                Poll::Pending
            }
        }
    }
}

impl Drop for LockTicket<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            let _ = self.mgr.cancel(&waiter);
        }
    }
}
