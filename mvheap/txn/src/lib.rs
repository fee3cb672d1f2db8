//! Transaction-id domain for the mvheap MVCC engine.
//!
//! This crate holds the pieces shared by every layer that reasons about
//! transaction identity: the id allocator with its commit-status table,
//! the immutable [`Snapshot`] value type, isolation levels, and the
//! transaction/manager traits implemented by the storage engine.

pub mod error;
pub mod snapshot;
pub mod transaction;
pub mod txid;

pub use error::TxidError;
pub use snapshot::Snapshot;
pub use transaction::{IsolationLevel, Transaction, TxnManager, TxnState};
pub use txid::{Txid, TxidAllocator, TxidStatus};
