use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::{
    contracts::{SimpleStorage, StoredValue, SIMPLE_STORAGE},
    tx::{Address, BlockHash, Hash32, SignatureError, SignedTransaction, TxAction, TxHash},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("nonce mismatch for {account}: expected {expected}, got {actual}")]
    NonceMismatch {
        account: Address,
        expected: u64,
        actual: u64,
    },
    #[error("no contract deployed at {address}")]
    UnknownContract { address: Address },
    #[error("duplicate transaction {0}")]
    DuplicateTransaction(TxHash),
    #[error("inconsistent snapshot: {0}")]
    CorruptSnapshot(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountState {
    pub nonce: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractInstance {
    pub code: String,
    pub deployer: Address,
    pub created_at: u64,
    pub storage: SimpleStorage,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiptStatus {
    Success { deployed: Option<Address> },
    Failed { reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_height: u64,
    pub status: ReceiptStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub timestamp: u64,
    pub parent: BlockHash,
    pub transactions: Vec<TxHash>,
    pub state_root: [u8; 32],
    pub hash: BlockHash,
}

impl BlockHeader {
    fn compute_hash(
        height: u64,
        timestamp: u64,
        parent: &BlockHash,
        transactions: &[TxHash],
        state_root: &[u8; 32],
    ) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(b"block");
        hasher.update(height.to_le_bytes());
        hasher.update(timestamp.to_le_bytes());
        hasher.update(parent.0);
        hasher.update((transactions.len() as u64).to_le_bytes());
        for tx in transactions {
            hasher.update(tx.0);
        }
        hasher.update(state_root);
        Hash32(hasher.finalize().into())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub timestamp: u64,
    pub last_block: Option<BlockHash>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub accounts: BTreeMap<Address, AccountState>,
    pub contracts: BTreeMap<Address, ContractInstance>,
    pub receipts: BTreeMap<TxHash, Receipt>,
    pub blocks: Vec<BlockHeader>,
    #[serde(with = "hex_root")]
    pub state_root: [u8; 32],
}

#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    pub meta: SnapshotMetadata,
    pub accounts: BTreeMap<Address, AccountState>,
    pub contracts: BTreeMap<Address, ContractInstance>,
    receipts: BTreeMap<TxHash, Receipt>,
    blocks: Vec<BlockHeader>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a ledger from a snapshot, checking that its block chain and
    /// state root agree with the stored accounts and contracts.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        let ledger = Self {
            meta: snapshot.meta,
            accounts: snapshot.accounts,
            contracts: snapshot.contracts,
            receipts: snapshot.receipts,
            blocks: snapshot.blocks,
        };
        if ledger.meta.height != ledger.blocks.len() as u64 {
            return Err(LedgerError::CorruptSnapshot(format!(
                "height {} but {} blocks",
                ledger.meta.height,
                ledger.blocks.len()
            )));
        }
        let tip = ledger.blocks.last();
        if ledger.meta.last_block != tip.map(|header| header.hash) {
            return Err(LedgerError::CorruptSnapshot(
                "last block does not match the chain tip".into(),
            ));
        }
        let root = ledger.state_root();
        if root != snapshot.state_root || tip.is_some_and(|header| header.state_root != root) {
            return Err(LedgerError::CorruptSnapshot("state root mismatch".into()));
        }
        Ok(ledger)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            accounts: self.accounts.clone(),
            contracts: self.contracts.clone(),
            receipts: self.receipts.clone(),
            blocks: self.blocks.clone(),
            state_root: self.state_root(),
        }
    }

    pub fn nonce(&self, account: &Address) -> u64 {
        self.accounts.get(account).map_or(0, |a| a.nonce)
    }

    pub fn read(&self, address: &Address) -> Result<&StoredValue, LedgerError> {
        self.contracts
            .get(address)
            .map(|instance| instance.storage.retrieve())
            .ok_or(LedgerError::UnknownContract { address: *address })
    }

    pub fn receipt(&self, tx_hash: &TxHash) -> Option<&Receipt> {
        self.receipts.get(tx_hash)
    }

    pub fn blocks(&self) -> &[BlockHeader] {
        &self.blocks
    }

    pub fn state_root(&self) -> [u8; 32] {
        compute_merkle_root(&self.accounts, &self.contracts)
    }

    /// Admission check run before a transaction enters a block.
    ///
    /// `expected_nonce` lets the caller account for transactions still
    /// waiting in a mempool.
    pub fn check_transaction(
        &self,
        signed: &SignedTransaction,
        expected_nonce: u64,
    ) -> Result<(), LedgerError> {
        signed.verify()?;
        let tx_hash = signed.hash();
        if self.receipts.contains_key(&tx_hash) {
            return Err(LedgerError::DuplicateTransaction(tx_hash));
        }
        if signed.tx.nonce != expected_nonce {
            return Err(LedgerError::NonceMismatch {
                account: signed.tx.sender_address(),
                expected: expected_nonce,
                actual: signed.tx.nonce,
            });
        }
        if let TxAction::Call { to, .. } = &signed.tx.action {
            if !self.contracts.contains_key(to) {
                return Err(LedgerError::UnknownContract { address: *to });
            }
        }
        Ok(())
    }

    fn apply_transaction(
        &mut self,
        signed: &SignedTransaction,
        height: u64,
    ) -> Result<Option<Address>, LedgerError> {
        let sender = signed.tx.sender_address();
        self.check_transaction(signed, self.nonce(&sender))?;
        let deployed = match &signed.tx.action {
            TxAction::Deploy => {
                let address = Address::for_contract(&sender, signed.tx.nonce);
                self.contracts.insert(
                    address,
                    ContractInstance {
                        code: SIMPLE_STORAGE.to_string(),
                        deployer: sender,
                        created_at: height,
                        storage: SimpleStorage::new(),
                    },
                );
                Some(address)
            }
            TxAction::Call { to, call } => {
                let instance = self
                    .contracts
                    .get_mut(to)
                    .ok_or(LedgerError::UnknownContract { address: *to })?;
                instance.storage.execute(call);
                None
            }
        };
        self.accounts.entry(sender).or_default().nonce += 1;
        Ok(deployed)
    }

    /// Applies `transactions` in order and appends a block.
    ///
    /// A transaction that fails gets a `Failed` receipt and leaves state and
    /// nonce untouched; the rest of the block still applies.
    pub fn seal_block(
        &mut self,
        transactions: &[SignedTransaction],
        timestamp: u64,
    ) -> BlockHeader {
        let height = self.meta.height + 1;
        let mut hashes = Vec::with_capacity(transactions.len());
        for signed in transactions {
            let tx_hash = signed.hash();
            if self.receipts.contains_key(&tx_hash) || hashes.contains(&tx_hash) {
                warn!(%tx_hash, "skipping duplicate transaction");
                continue;
            }
            let status = match self.apply_transaction(signed, height) {
                Ok(deployed) => ReceiptStatus::Success { deployed },
                Err(err) => {
                    warn!(%tx_hash, %err, "transaction failed");
                    ReceiptStatus::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            self.receipts.insert(
                tx_hash,
                Receipt {
                    tx_hash,
                    block_height: height,
                    status,
                },
            );
            hashes.push(tx_hash);
        }

        let parent = self.meta.last_block.unwrap_or_default();
        let state_root = self.state_root();
        let hash = BlockHeader::compute_hash(height, timestamp, &parent, &hashes, &state_root);
        let header = BlockHeader {
            height,
            timestamp,
            parent,
            transactions: hashes,
            state_root,
            hash,
        };
        self.blocks.push(header.clone());
        self.meta.height = height;
        self.meta.timestamp = timestamp;
        self.meta.last_block = Some(hash);
        header
    }
}

fn compute_merkle_root(
    accounts: &BTreeMap<Address, AccountState>,
    contracts: &BTreeMap<Address, ContractInstance>,
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::new();
    for (address, account) in accounts {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        hasher.update(address.0);
        hasher.update(account.nonce.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for (address, instance) in contracts {
        let value = instance.storage.retrieve().to_bytes_be();
        let mut hasher = Sha256::new();
        hasher.update(b"contract");
        hasher.update(address.0);
        hasher.update(instance.code.as_bytes());
        hasher.update(instance.deployer.0);
        hasher.update(instance.created_at.to_le_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(&value);
        leaves.push(hasher.finalize().into());
    }
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"simple-storage-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

mod hex_root {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&encoded, &mut out).map_err(D::Error::custom)?;
        Ok(out)
    }
}
