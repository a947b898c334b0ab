//! The narrow interface between the driver and whatever ledger hosts the
//! contract.
//!
//! Every operation is asynchronous. `write` only submits; the value becomes
//! visible to `read` once `await_confirmation` has resolved the returned
//! [`PendingWrite`].

use async_trait::async_trait;
use num_bigint::BigUint;

use crate::{
    contracts::{StoredValue, ValueError},
    ledger::LedgerError,
    tx::{Address, BlockHash, TxHash},
};

pub mod devnet;
pub mod memory;

/// Coarse classification of [`HostError`]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Unauthorized,
    NotFound,
    InvalidArgument,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The host could not be reached or stopped answering.
    #[error("host unreachable: {0}")]
    Transport(String),

    /// Missing or invalid signing credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No contract instance lives at the address.
    #[error("no contract deployed at {address}")]
    NotFound { address: Address },

    /// The host refused an argument (range, encoding, sequencing).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The transaction made it into a block but failed there.
    #[error("transaction {tx_hash} failed: {reason}")]
    Rejected { tx_hash: TxHash, reason: String },
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::Transport(_) => ErrorKind::Transport,
            HostError::Unauthorized(_) => ErrorKind::Unauthorized,
            HostError::NotFound { .. } => ErrorKind::NotFound,
            HostError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            HostError::Rejected { .. } => ErrorKind::Rejected,
        }
    }
}

impl From<LedgerError> for HostError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Signature(err) => HostError::Unauthorized(err.to_string()),
            LedgerError::UnknownContract { address } => HostError::NotFound { address },
            err @ (LedgerError::NonceMismatch { .. } | LedgerError::DuplicateTransaction(_)) => {
                HostError::InvalidArgument(err.to_string())
            }
            err @ LedgerError::CorruptSnapshot(_) => HostError::Transport(err.to_string()),
        }
    }
}

impl From<ValueError> for HostError {
    fn from(err: ValueError) -> Self {
        HostError::InvalidArgument(err.to_string())
    }
}

/// Acknowledged instantiation of a counter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deployment {
    pub address: Address,
    pub tx_hash: TxHash,
    pub block_height: u64,
}

/// A submitted write whose confirmation has not been awaited yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingWrite {
    pub tx_hash: TxHash,
    pub address: Address,
    pub value: StoredValue,
}

/// Durable inclusion of a write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    pub tx_hash: TxHash,
    pub block_height: u64,
    pub block_hash: BlockHash,
}

#[async_trait]
pub trait Host: Send + Sync {
    /// Creates a new counter and waits until the host acknowledges it.
    async fn instantiate(&self) -> Result<Deployment, HostError>;

    /// Submits a store of `value`. Range checking happens on the host.
    async fn write(&self, address: &Address, value: BigUint) -> Result<PendingWrite, HostError>;

    async fn await_confirmation(&self, pending: PendingWrite) -> Result<Confirmation, HostError>;

    async fn read(&self, address: &Address) -> Result<StoredValue, HostError>;
}
