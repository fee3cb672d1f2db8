//! Wait-for graph and cycle detection.
//!
//! An edge `A -> B` means transaction A is waiting on a lock held by B.
//! Detection runs synchronously on every edge insertion, so the worst-case
//! detection latency is bounded by one lock request. The victim is always
//! the transaction whose edge insertion closed the cycle.

use std::collections::{HashMap, HashSet};

use mvheap_txn::Txid;

#[derive(Default)]
pub(crate) struct WaitForGraph {
    edges: HashMap<Txid, HashSet<Txid>>,
}

impl WaitForGraph {
    /// Replace the outgoing edges of `waiter`. A transaction waits on at
    /// most one lock at a time, so the previous edge set is superseded.
    pub(crate) fn set_wait(&mut self, waiter: Txid, holders: impl IntoIterator<Item = Txid>) {
        let set: HashSet<Txid> = holders.into_iter().filter(|h| *h != waiter).collect();
        if set.is_empty() {
            self.edges.remove(&waiter);
        } else {
            self.edges.insert(waiter, set);
        }
    }

    pub(crate) fn clear_wait(&mut self, waiter: Txid) {
        self.edges.remove(&waiter);
    }

    /// Whether `start` can reach itself through wait-for edges.
    pub(crate) fn on_cycle(&self, start: Txid) -> bool {
        let Some(first) = self.edges.get(&start) else {
            return false;
        };
        let mut stack: Vec<Txid> = first.iter().copied().collect();
        let mut seen: HashSet<Txid> = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == start {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = self.edges.get(&node) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }
}
