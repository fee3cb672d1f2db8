use thiserror::Error;

use crate::txid::TxidStatus;

#[derive(Error, Debug)]
pub enum TxidError {
    #[error("txid space exhausted at {0}")]
    Overflow(u64),

    #[error("invalid status transition for txid {txid}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        txid: u64,
        from: TxidStatus,
        to: TxidStatus,
    },
}
