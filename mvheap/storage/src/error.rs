use mvheap_txn::{Txid, TxidError};
use thiserror::Error;

use crate::heap::RowKey;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Row error: {0}")]
    Row(#[from] RowError),
    #[error("Txid error: {0}")]
    Txid(#[from] TxidError),
}

impl StorageError {
    /// Whether retrying the whole transaction from `begin` may succeed.
    /// Everything else signals a caller bug and is not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Transaction(
                TransactionError::DeadlockDetected(_)
                    | TransactionError::SerializationFailure(_)
                    | TransactionError::WriteConflict(_)
                    | TransactionError::LockWaitTimeout(_)
            )
        )
    }
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("deadlock detected: {0}")]
    DeadlockDetected(String),
    #[error("serialization failure: {0}")]
    SerializationFailure(String),
    #[error("write conflict: {0}")]
    WriteConflict(String),
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),
    #[error("lock wait timeout: {0}")]
    LockWaitTimeout(String),
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),
}

#[derive(Error, Debug)]
pub enum RowError {
    #[error("row {0} not found")]
    RowNotFound(RowKey),
    #[error("row {row} already deleted by transaction {by}")]
    AlreadyDeletedBy { row: RowKey, by: Txid },
}
