use hostvault_protocol::{AddressError, BlockAddress};
use std::path::PathBuf;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("ledger rejected transaction {tx_hash}")]
    Rejected { tx_hash: String },
    #[error("ledger rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("ledger response decode error: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transfer network http error: {0}")]
    Http(String),
    #[error("transfer network i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer network returned an invalid address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("transfer network response decode error: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("tracking store error: {0}")]
    Sled(#[from] sled::Error),
    #[error("tracking store codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("invalid record: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),
    #[error("file not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("no upload named {0:?} is tracked")]
    UnknownUpload(String),
    #[error("upload {0:?} has no ledger assignment yet")]
    NotAssigned(String),
    #[error("upload {0:?} is not in the mounted state")]
    NotMounted(String),
    #[error("replica count must be at least 1")]
    ReplicaCount,
    #[error("amount overflow while pricing {0:?}")]
    AmountOverflow(String),
    #[error("insufficient funds: need {required}, have {available}")]
    InsufficientFunds { required: u128, available: u128 },
    #[error("partial batch: {succeeded} succeeded, {} failed", .failed.len())]
    PartialBatch {
        succeeded: usize,
        failed: Vec<(BlockAddress, String)>,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("stream is corrupt or truncated: {0}")]
    Corrupt(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
