//! Transaction trait and related types.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::txid::Txid;

/// Isolation level for transactions, modeled as a closed variant consumed
/// by the snapshot logic and the conflict detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// A fresh snapshot per statement; reads observe the latest commits.
    ReadCommitted,
    /// One snapshot for the whole transaction.
    RepeatableRead,
    /// Repeatable-read snapshots plus commit-time dependency validation.
    Serializable,
}

impl IsolationLevel {
    /// Whether reads take a fresh snapshot per statement.
    pub fn statement_snapshot(&self) -> bool {
        matches!(self, IsolationLevel::ReadCommitted)
    }

    pub fn is_serializable(&self) -> bool {
        matches!(self, IsolationLevel::Serializable)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// Core operations every transaction handle supports.
pub trait Transaction: Send + Sync {
    /// The error type for transaction operations.
    type Error;

    /// Get the transaction id.
    fn txid(&self) -> Txid;

    /// Get the isolation level of the transaction.
    fn isolation_level(&self) -> IsolationLevel;

    /// Get the current lifecycle state.
    fn state(&self) -> TxnState;

    /// Commit the transaction.
    fn commit(&self) -> Result<(), Self::Error>;

    /// Roll the transaction back, discarding all of its writes.
    fn rollback(&self) -> Result<(), Self::Error>;
}

/// Trait for the component that owns transaction lifecycles: beginning
/// transactions, retiring them, and exposing the reclamation horizon.
pub trait TxnManager {
    /// The transaction type this manager hands out.
    type Transaction: Transaction + Send + Sync;
    /// The error type for operations.
    type Error;

    /// Begin a new transaction at the given isolation level.
    fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Arc<Self::Transaction>, Self::Error>;

    /// Oldest txid any present or future snapshot can still reference.
    /// Versions dead below this horizon are reclaimable.
    fn global_xmin(&self) -> Txid;
}
