//! Single-value storage contract and the tooling around it.
//!
//! The crate is split into small layers that the binaries combine:
//!
//! * [`contracts`] — the `SimpleStorage` contract and its bounded [`StoredValue`].
//! * [`tx`] — signed transactions addressed to the ledger.
//! * [`ledger`] — the ledger state machine: accounts, nonces, deployed
//!   instances, blocks and receipts.
//! * [`host`] — the narrow interface the driver talks to, with an in-memory
//!   double and an in-process development node.
//! * [`driver`] — deploy, read, write, confirm, read again.
//! * [`config`] — command-line options shared by the binaries.

pub mod config;
pub mod contracts;
pub mod driver;
pub mod host;
pub mod ledger;
pub mod tx;

pub use contracts::{SimpleStorage, StoredValue};
pub use host::{Host, HostError};
