//! In-memory [`Host`] double. Everything resolves immediately; writes only
//! become visible once their confirmation is awaited.

use std::collections::BTreeMap;

use async_trait::async_trait;
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::{Confirmation, Deployment, Host, HostError, PendingWrite};
use crate::{
    contracts::StoredValue,
    tx::{Address, Hash32},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Operation {
    Instantiate,
    Write,
    AwaitConfirmation,
    Read,
}

#[derive(Default)]
struct MemoryState {
    contracts: BTreeMap<Address, StoredValue>,
    pending: BTreeMap<Hash32, (Address, StoredValue)>,
    failures: BTreeMap<Operation, HostError>,
    log: Vec<Operation>,
    height: u64,
    sequence: u64,
}

impl MemoryState {
    fn enter(&mut self, operation: Operation) -> Result<(), HostError> {
        self.log.push(operation);
        match self.failures.remove(&operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<MemoryState>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to `operation` fail with `error`.
    pub fn failing_on(mut self, operation: Operation, error: HostError) -> Self {
        self.state.get_mut().failures.insert(operation, error);
        self
    }

    /// Operations invoked so far, in call order.
    pub async fn operations(&self) -> Vec<Operation> {
        self.state.lock().await.log.clone()
    }
}

fn hash_of(id: u64) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(b"memory-tx");
    hasher.update(id.to_le_bytes());
    Hash32(hasher.finalize().into())
}

#[async_trait]
impl Host for MemoryHost {
    async fn instantiate(&self) -> Result<Deployment, HostError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::Instantiate)?;
        let id = state.next_id();
        let address = Address::for_contract(&Address::default(), id);
        state.contracts.insert(address, StoredValue::zero());
        state.height += 1;
        Ok(Deployment {
            address,
            tx_hash: hash_of(id),
            block_height: state.height,
        })
    }

    async fn write(&self, address: &Address, value: BigUint) -> Result<PendingWrite, HostError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::Write)?;
        if !state.contracts.contains_key(address) {
            return Err(HostError::NotFound { address: *address });
        }
        let value = StoredValue::new(value)?;
        let tx_hash = hash_of(state.next_id());
        state.pending.insert(tx_hash, (*address, value.clone()));
        Ok(PendingWrite {
            tx_hash,
            address: *address,
            value,
        })
    }

    async fn await_confirmation(&self, pending: PendingWrite) -> Result<Confirmation, HostError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::AwaitConfirmation)?;
        let (address, value) = state.pending.remove(&pending.tx_hash).ok_or_else(|| {
            HostError::InvalidArgument(format!("unknown transaction {}", pending.tx_hash))
        })?;
        state.contracts.insert(address, value);
        state.height += 1;
        Ok(Confirmation {
            tx_hash: pending.tx_hash,
            block_height: state.height,
            block_hash: hash_of(u64::MAX - state.height),
        })
    }

    async fn read(&self, address: &Address) -> Result<StoredValue, HostError> {
        let mut state = self.state.lock().await;
        state.enter(Operation::Read)?;
        state
            .contracts
            .get(address)
            .cloned()
            .ok_or(HostError::NotFound { address: *address })
    }
}
