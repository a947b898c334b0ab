//! In-process development ledger.
//!
//! A [`Devnet`] owns a [`LedgerState`], a mempool of signed transactions and
//! the confirmation waiters, all behind one async mutex. Blocks are sealed
//! either when a confirmation is awaited (instant mode) or by a background
//! task on a fixed period. When a path is configured, the ledger snapshot is
//! loaded on open and rewritten after every sealed block.

use std::{
    collections::BTreeMap,
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use num_bigint::BigUint;
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use super::{Confirmation, Deployment, Host, HostError, PendingWrite};
use crate::{
    contracts::{StorageCall, StoredValue},
    ledger::{LedgerSnapshot, LedgerState, Receipt, ReceiptStatus},
    tx::{Address, BlockHash, PublicKey, SignedTransaction, Transaction, TxAction, TxHash},
};

#[derive(Clone, Debug, Default)]
pub struct DevnetConfig {
    /// Snapshot file; `None` keeps the ledger in memory.
    pub path: Option<PathBuf>,
    /// Sealing period; `None` seals on demand.
    pub block_time: Option<Duration>,
    pub confirmation_timeout: Option<Duration>,
}

struct Sealed {
    receipt: Receipt,
    block_hash: BlockHash,
}

struct NodeState {
    ledger: LedgerState,
    mempool: Vec<SignedTransaction>,
    waiters: BTreeMap<TxHash, Vec<oneshot::Sender<Sealed>>>,
    path: Option<PathBuf>,
}

impl NodeState {
    fn next_nonce(&self, account: &Address) -> u64 {
        let queued = self
            .mempool
            .iter()
            .filter(|signed| signed.tx.sender_address() == *account)
            .count() as u64;
        self.ledger.nonce(account) + queued
    }

    fn sealed(&self, tx_hash: &TxHash) -> Option<Sealed> {
        let receipt = self.ledger.receipt(tx_hash)?;
        let header = self
            .ledger
            .blocks()
            .get(receipt.block_height.checked_sub(1)? as usize)?;
        Some(Sealed {
            receipt: receipt.clone(),
            block_hash: header.hash,
        })
    }

    /// Seals the mempool into a block on a copy of the ledger and adopts the
    /// copy only once it is persisted.
    ///
    /// On a persistence failure the ledger stays at its last persisted block,
    /// the drained transactions are dropped and their waiters fail.
    async fn seal_pending(&mut self) -> Result<(), HostError> {
        if self.mempool.is_empty() {
            return Ok(());
        }
        let transactions = std::mem::take(&mut self.mempool);
        let mut candidate = self.ledger.clone();
        let header = candidate.seal_block(&transactions, unix_now());

        if let Err(err) = self.persist(&candidate).await {
            for signed in &transactions {
                self.waiters.remove(&signed.hash());
            }
            return Err(err);
        }
        self.ledger = candidate;
        info!(
            height = header.height,
            transactions = header.transactions.len(),
            hash = %header.hash,
            "sealed block"
        );

        for tx_hash in &header.transactions {
            let Some(waiters) = self.waiters.remove(tx_hash) else {
                continue;
            };
            for waiter in waiters {
                if let Some(sealed) = self.sealed(tx_hash) {
                    let _ = waiter.send(sealed);
                }
            }
        }
        Ok(())
    }

    async fn persist(&self, ledger: &LedgerState) -> Result<(), HostError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&ledger.snapshot())
            .map_err(|e| HostError::Transport(format!("encode ledger snapshot: {e}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create ledger directory", parent, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error("write ledger", &tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error("replace ledger", path, e))?;
        debug!(path = %path.display(), height = ledger.meta.height, "ledger persisted");
        Ok(())
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> HostError {
    HostError::Transport(format!("{action} {}: {err}", path.display()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn load_ledger(path: &Path) -> Result<LedgerState, HostError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
                HostError::Transport(format!("corrupt ledger {}: {e}", path.display()))
            })?;
            let ledger = LedgerState::from_snapshot(snapshot).map_err(|e| {
                HostError::Transport(format!("corrupt ledger {}: {e}", path.display()))
            })?;
            info!(path = %path.display(), height = ledger.meta.height, "ledger loaded");
            Ok(ledger)
        }
        Err(err) if err.kind() == IoErrorKind::NotFound => {
            info!(path = %path.display(), "starting a fresh ledger");
            Ok(LedgerState::new())
        }
        Err(err) => Err(io_error("read ledger", path, err)),
    }
}

async fn produce_blocks(node: Arc<Mutex<NodeState>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut state = node.lock().await;
        if let Err(err) = state.seal_pending().await {
            error!(%err, "block not persisted, its transactions were dropped");
        }
    }
}

pub struct Devnet {
    node: Arc<Mutex<NodeState>>,
    signer: Option<SigningKey>,
    instant: bool,
    confirmation_timeout: Option<Duration>,
    producer: Option<JoinHandle<()>>,
}

impl Devnet {
    /// Opens the ledger described by `config`. Without a `signer` the node is
    /// read-only.
    pub async fn open(config: DevnetConfig, signer: Option<SigningKey>) -> Result<Self, HostError> {
        let ledger = match &config.path {
            Some(path) => load_ledger(path).await?,
            None => LedgerState::new(),
        };
        let node = Arc::new(Mutex::new(NodeState {
            ledger,
            mempool: Vec::new(),
            waiters: BTreeMap::new(),
            path: config.path,
        }));
        let producer = config
            .block_time
            .map(|period| tokio::spawn(produce_blocks(node.clone(), period)));
        Ok(Self {
            node,
            signer,
            instant: config.block_time.is_none(),
            confirmation_timeout: config.confirmation_timeout,
            producer,
        })
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(crate::tx::signer_address)
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.node.lock().await.ledger.snapshot()
    }

    async fn submit(&self, action: TxAction) -> Result<TxHash, HostError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| HostError::Unauthorized("no signing key configured".into()))?;
        let sender = PublicKey::from(&signer.verifying_key());
        let mut node = self.node.lock().await;
        let nonce = node.next_nonce(&Address::from_public_key(&sender));
        let signed = Transaction {
            sender,
            nonce,
            action,
        }
        .sign(signer);
        node.ledger.check_transaction(&signed, nonce)?;
        let tx_hash = signed.hash();
        debug!(%tx_hash, nonce, "transaction queued");
        node.mempool.push(signed);
        Ok(tx_hash)
    }

    async fn wait_for(&self, tx_hash: TxHash) -> Result<Sealed, HostError> {
        let receiver = {
            let mut node = self.node.lock().await;
            if let Some(sealed) = node.sealed(&tx_hash) {
                return Ok(sealed);
            }
            if !node.mempool.iter().any(|signed| signed.hash() == tx_hash) {
                return Err(HostError::InvalidArgument(format!(
                    "unknown transaction {tx_hash}"
                )));
            }
            let (sender, receiver) = oneshot::channel();
            node.waiters.entry(tx_hash).or_default().push(sender);
            if self.instant {
                node.seal_pending().await?;
            }
            receiver
        };
        let received = match self.confirmation_timeout {
            Some(limit) => tokio::time::timeout(limit, receiver).await.map_err(|_| {
                HostError::Transport(format!("timed out waiting for {tx_hash}"))
            })?,
            None => receiver.await,
        };
        received.map_err(|_| HostError::Transport(format!("confirmation of {tx_hash} was lost")))
    }
}

impl Drop for Devnet {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

fn rejected(receipt: &Receipt, reason: String) -> HostError {
    HostError::Rejected {
        tx_hash: receipt.tx_hash,
        reason,
    }
}

#[async_trait]
impl Host for Devnet {
    async fn instantiate(&self) -> Result<Deployment, HostError> {
        let tx_hash = self.submit(TxAction::Deploy).await?;
        let sealed = self.wait_for(tx_hash).await?;
        match sealed.receipt.status {
            ReceiptStatus::Success {
                deployed: Some(address),
            } => {
                info!(%address, block = sealed.receipt.block_height, "contract deployed");
                Ok(Deployment {
                    address,
                    tx_hash,
                    block_height: sealed.receipt.block_height,
                })
            }
            ReceiptStatus::Success { deployed: None } => Err(rejected(
                &sealed.receipt,
                "deployment produced no address".into(),
            )),
            ReceiptStatus::Failed { ref reason } => Err(rejected(&sealed.receipt, reason.clone())),
        }
    }

    async fn write(&self, address: &Address, value: BigUint) -> Result<PendingWrite, HostError> {
        let value = StoredValue::new(value)?;
        let tx_hash = self
            .submit(TxAction::Call {
                to: *address,
                call: StorageCall::Store {
                    value: value.clone(),
                },
            })
            .await?;
        Ok(PendingWrite {
            tx_hash,
            address: *address,
            value,
        })
    }

    async fn await_confirmation(&self, pending: PendingWrite) -> Result<Confirmation, HostError> {
        let sealed = self.wait_for(pending.tx_hash).await?;
        if let ReceiptStatus::Failed { reason } = &sealed.receipt.status {
            return Err(rejected(&sealed.receipt, reason.clone()));
        }
        Ok(Confirmation {
            tx_hash: pending.tx_hash,
            block_height: sealed.receipt.block_height,
            block_hash: sealed.block_hash,
        })
    }

    async fn read(&self, address: &Address) -> Result<StoredValue, HostError> {
        let node = self.node.lock().await;
        Ok(node.ledger.read(address)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::tx::{generate_signing_key, signer_address};

    async fn instant() -> Devnet {
        Devnet::open(DevnetConfig::default(), Some(generate_signing_key()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn instant_node_confirms_on_await() {
        let node = instant().await;
        let deployment = node.instantiate().await.unwrap();
        assert_eq!(deployment.block_height, 1);
        assert!(node.read(&deployment.address).await.unwrap().is_zero());

        let pending = node
            .write(&deployment.address, BigUint::from(50u32))
            .await
            .unwrap();
        // still queued
        assert!(node.read(&deployment.address).await.unwrap().is_zero());

        let confirmation = node.await_confirmation(pending).await.unwrap();
        assert_eq!(confirmation.block_height, 2);
        assert_eq!(
            node.read(&deployment.address).await.unwrap(),
            StoredValue::from(50)
        );
        let snapshot = node.snapshot().await;
        assert_eq!(snapshot.blocks[1].hash, confirmation.block_hash);
    }

    #[tokio::test]
    async fn queued_writes_keep_their_order() {
        let node = instant().await;
        let deployment = node.instantiate().await.unwrap();
        let first = node
            .write(&deployment.address, BigUint::from(50u32))
            .await
            .unwrap();
        let second = node
            .write(&deployment.address, BigUint::from(100u32))
            .await
            .unwrap();
        let confirmed = node.await_confirmation(second).await.unwrap();
        // both went into the same block
        assert_eq!(node.await_confirmation(first).await.unwrap().block_height, confirmed.block_height);
        assert_eq!(
            node.read(&deployment.address).await.unwrap(),
            StoredValue::from(100)
        );
    }

    #[tokio::test]
    async fn read_only_node_refuses_to_sign() {
        let node = Devnet::open(DevnetConfig::default(), None).await.unwrap();
        assert_matches!(node.instantiate().await, Err(HostError::Unauthorized(_)));
        assert_eq!(node.signer_address(), None);
    }

    #[tokio::test]
    async fn unknown_contract_and_bad_values_are_refused() {
        let node = instant().await;
        let address = Address([8u8; 20]);
        assert_eq!(
            node.read(&address).await.unwrap_err(),
            HostError::NotFound { address }
        );
        assert_eq!(
            node.write(&address, BigUint::from(1u32)).await.unwrap_err(),
            HostError::NotFound { address }
        );

        let deployment = node.instantiate().await.unwrap();
        assert_matches!(
            node.write(&deployment.address, BigUint::from(1u8) << 300u32)
                .await,
            Err(HostError::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn interval_node_seals_in_the_background() {
        let config = DevnetConfig {
            block_time: Some(Duration::from_millis(20)),
            confirmation_timeout: Some(Duration::from_secs(5)),
            ..DevnetConfig::default()
        };
        let node = Devnet::open(config, Some(generate_signing_key()))
            .await
            .unwrap();
        let deployment = node.instantiate().await.unwrap();
        let pending = node
            .write(&deployment.address, BigUint::from(9u32))
            .await
            .unwrap();
        let confirmation = node.await_confirmation(pending).await.unwrap();
        assert!(confirmation.block_height > deployment.block_height);
        assert_eq!(
            node.read(&deployment.address).await.unwrap(),
            StoredValue::from(9)
        );
    }

    #[tokio::test]
    async fn slow_blocks_hit_the_confirmation_timeout() {
        let config = DevnetConfig {
            block_time: Some(Duration::from_secs(60)),
            confirmation_timeout: Some(Duration::from_millis(50)),
            ..DevnetConfig::default()
        };
        let node = Devnet::open(config, Some(generate_signing_key()))
            .await
            .unwrap();
        assert_matches!(node.instantiate().await, Err(HostError::Transport(_)));
    }

    #[tokio::test]
    async fn ledger_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.json");
        let config = DevnetConfig {
            path: Some(path.clone()),
            ..DevnetConfig::default()
        };

        let key = generate_signing_key();
        let address = {
            let node = Devnet::open(config.clone(), Some(key.clone())).await.unwrap();
            let deployment = node.instantiate().await.unwrap();
            let pending = node
                .write(&deployment.address, BigUint::from(50u32))
                .await
                .unwrap();
            node.await_confirmation(pending).await.unwrap();
            deployment.address
        };
        assert!(path.exists());

        let reopened = Devnet::open(config.clone(), None).await.unwrap();
        assert_eq!(reopened.read(&address).await.unwrap(), StoredValue::from(50));
        assert_eq!(reopened.snapshot().await.meta.height, 2);

        // nonces carry over, so a second deployment gets a fresh address
        let again = Devnet::open(config, Some(key)).await.unwrap();
        let second = again.instantiate().await.unwrap();
        assert_ne!(second.address, address);
        assert_eq!(second.block_height, 3);
    }

    /// Blocks ledger writes by putting a file where the ledger directory
    /// should be.
    fn block_ledger_dir(dir: &Path) -> PathBuf {
        let blocker = dir.join("state");
        std::fs::write(&blocker, b"not a directory").unwrap();
        blocker
    }

    #[tokio::test]
    async fn unpersisted_block_is_not_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.json");
        let config = DevnetConfig {
            path: Some(path.clone()),
            ..DevnetConfig::default()
        };
        let key = generate_signing_key();
        let node = Devnet::open(config.clone(), Some(key.clone())).await.unwrap();

        let blocker = block_ledger_dir(dir.path());
        assert_matches!(node.instantiate().await, Err(HostError::Transport(_)));
        let first = Address::for_contract(&signer_address(&key), 0);
        assert_eq!(
            node.read(&first).await.unwrap_err(),
            HostError::NotFound { address: first }
        );
        let snapshot = node.snapshot().await;
        assert_eq!(snapshot.meta.height, 0);
        assert!(snapshot.receipts.is_empty());

        std::fs::remove_file(blocker).unwrap();
        let deployment = node.instantiate().await.unwrap();
        // the dropped deployment never consumed its nonce
        assert_eq!(deployment.address, first);
        assert_eq!(deployment.block_height, 1);

        let reopened = Devnet::open(config, None).await.unwrap();
        let snapshot = reopened.snapshot().await;
        assert_eq!(snapshot.meta.height, 1);
        assert_eq!(snapshot.receipts.len(), 1);
        assert!(reopened.read(&first).await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn interval_node_does_not_build_on_unpersisted_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let config = DevnetConfig {
            path: Some(dir.path().join("state").join("ledger.json")),
            block_time: Some(Duration::from_millis(20)),
            confirmation_timeout: Some(Duration::from_secs(5)),
        };
        let node = Devnet::open(config, Some(generate_signing_key()))
            .await
            .unwrap();

        let blocker = block_ledger_dir(dir.path());
        assert!(node.instantiate().await.is_err());
        assert_eq!(node.snapshot().await.meta.height, 0);

        std::fs::remove_file(blocker).unwrap();
        let deployment = node.instantiate().await.unwrap();
        assert_eq!(deployment.block_height, 1);
    }

    #[tokio::test]
    async fn largest_value_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = DevnetConfig {
            path: Some(dir.path().join("ledger.json")),
            ..DevnetConfig::default()
        };
        let max = (BigUint::from(1u8) << 256u32) - 1u8;

        let address = {
            let node = Devnet::open(config.clone(), Some(generate_signing_key()))
                .await
                .unwrap();
            let deployment = node.instantiate().await.unwrap();
            let pending = node.write(&deployment.address, max.clone()).await.unwrap();
            node.await_confirmation(pending).await.unwrap();
            deployment.address
        };

        let reopened = Devnet::open(config, None).await.unwrap();
        assert_eq!(reopened.read(&address).await.unwrap().as_biguint(), &max);
    }

    #[tokio::test]
    async fn transaction_failing_in_block_is_rejected() {
        let key = generate_signing_key();
        let node = Devnet::open(DevnetConfig::default(), Some(key.clone()))
            .await
            .unwrap();
        let deployment = node.instantiate().await.unwrap();

        // nonce 0 was spent by the deployment
        let value = StoredValue::from(7);
        let stale = Transaction {
            sender: PublicKey::from(&key.verifying_key()),
            nonce: 0,
            action: TxAction::Call {
                to: deployment.address,
                call: StorageCall::Store {
                    value: value.clone(),
                },
            },
        }
        .sign(&key);
        let tx_hash = stale.hash();
        node.node.lock().await.mempool.push(stale);

        let pending = PendingWrite {
            tx_hash,
            address: deployment.address,
            value,
        };
        assert_matches!(
            node.await_confirmation(pending).await,
            Err(HostError::Rejected { tx_hash: rejected, .. }) if rejected == tx_hash
        );
        assert!(node.read(&deployment.address).await.unwrap().is_zero());
    }

    #[tokio::test]
    async fn hand_edited_ledger_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let config = DevnetConfig {
            path: Some(path.clone()),
            ..DevnetConfig::default()
        };
        {
            let node = Devnet::open(config.clone(), Some(generate_signing_key()))
                .await
                .unwrap();
            let deployment = node.instantiate().await.unwrap();
            let pending = node
                .write(&deployment.address, BigUint::from(50u32))
                .await
                .unwrap();
            node.await_confirmation(pending).await.unwrap();
        }

        let mut snapshot: LedgerSnapshot =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        snapshot.meta.height = 7;
        std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let err = Devnet::open(config, None).await.err().unwrap();
        assert_matches!(err, HostError::Transport(reason) if reason.contains("corrupt ledger"));
    }
}
