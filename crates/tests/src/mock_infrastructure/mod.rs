//! Scripted chain infrastructure for integration tests.
//!
//! [`MockProvider`] plays the role of the JSON-RPC node: tests script a
//! canonical chain (and fork branches), repoint it to simulate reorgs, and
//! inspect every raw transaction the responder broadcasts. The
//! [`StubSigner`] serializes requests instead of signing, so tests can
//! decode exactly what would have gone on the wire.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use pisa_core::provider::{ChainProvider, ProviderError};
use pisa_core::responder::{SignerError, TransactionSigner};
use pisa_core::types::{
    Address, Block, Hash256, Log, Receipt, ResponseIdentifier, Transaction, TransactionRequest,
};

/// Address the test responder signs from.
pub const RESPONDER_ADDRESS: Address = [0xEE; 20];

#[derive(Default)]
struct ChainInner {
    blocks_by_hash: HashMap<Hash256, Block>,
    canonical: BTreeMap<u64, Hash256>,
    tip: u64,
    tx_counts: HashMap<Address, u64>,
    balances: HashMap<Address, u128>,
    gas_price: u128,
    broadcasts: Vec<Vec<u8>>,
}

pub struct MockProvider {
    inner: Mutex<ChainInner>,
    notify_tx: mpsc::UnboundedSender<u64>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<u64>>>,
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inner: Mutex::new(ChainInner { gas_price: 10, ..ChainInner::default() }),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
        })
    }

    /// Appends a block to the canonical chain and advances the tip.
    pub fn add_canonical(&self, block: Block) {
        let mut inner = self.inner.lock();
        inner.canonical.insert(block.number, block.hash);
        inner.tip = inner.tip.max(block.number);
        inner.blocks_by_hash.insert(block.hash, block);
    }

    /// Stores a block reachable only by hash (a fork branch).
    pub fn add_fork(&self, block: Block) {
        self.inner.lock().blocks_by_hash.insert(block.hash, block);
    }

    /// Repoints the canonical chain at `number` (and truncates everything
    /// above it), simulating a reorg.
    pub fn reorg_to(&self, blocks: Vec<Block>) {
        let mut inner = self.inner.lock();
        let Some(first) = blocks.first().map(|b| b.number) else { return };
        inner.canonical.split_off(&first);
        for block in blocks {
            inner.canonical.insert(block.number, block.hash);
            inner.tip = inner.tip.max(block.number);
            inner.blocks_by_hash.insert(block.hash, block);
        }
    }

    /// Pushes a tip notification into the subscription stream.
    pub fn notify(&self, number: u64) {
        let _ = self.notify_tx.send(number);
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.inner.lock().tx_counts.insert(address, count);
    }

    pub fn set_balance(&self, address: Address, balance: u128) {
        self.inner.lock().balances.insert(address, balance);
    }

    pub fn set_gas_price(&self, price: u128) {
        self.inner.lock().gas_price = price;
    }

    /// Every raw transaction broadcast so far, oldest first.
    #[must_use]
    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.inner.lock().broadcasts.clone()
    }

    /// Broadcasts decoded through the [`StubSigner`] encoding.
    #[must_use]
    pub fn broadcast_requests(&self) -> Vec<TransactionRequest> {
        self.broadcasts()
            .iter()
            .filter_map(|raw| serde_json::from_slice(raw).ok())
            .collect()
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, ProviderError> {
        let inner = self.inner.lock();
        Ok(inner
            .canonical
            .get(&number)
            .and_then(|hash| inner.blocks_by_hash.get(hash))
            .cloned())
    }

    async fn block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ProviderError> {
        Ok(self.inner.lock().blocks_by_hash.get(hash).cloned())
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        Ok(self.inner.lock().tip)
    }

    async fn transaction_receipt(
        &self,
        _tx_hash: &Hash256,
    ) -> Result<Option<Receipt>, ProviderError> {
        Ok(None)
    }

    async fn transaction_count(&self, address: &Address) -> Result<u64, ProviderError> {
        Ok(self.inner.lock().tx_counts.get(address).copied().unwrap_or(0))
    }

    async fn balance(&self, address: &Address) -> Result<u128, ProviderError> {
        Ok(self.inner.lock().balances.get(address).copied().unwrap_or(u128::MAX))
    }

    async fn gas_price(&self) -> Result<u128, ProviderError> {
        Ok(self.inner.lock().gas_price)
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, ProviderError> {
        Ok(tx.gas_limit)
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<Hash256, ProviderError> {
        let mut inner = self.inner.lock();
        inner.broadcasts.push(raw);
        let mut hash = [0u8; 32];
        hash[0] = inner.broadcasts.len() as u8;
        Ok(hash)
    }

    async fn subscribe_blocks(&self) -> Result<BoxStream<'static, u64>, ProviderError> {
        let receiver = self
            .notify_rx
            .lock()
            .take()
            .ok_or_else(|| ProviderError::Transport("already subscribed".to_string()))?;
        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|n| (n, rx))
        })
        .boxed())
    }
}

/// Serializes requests as JSON instead of signing them.
pub struct StubSigner;

impl TransactionSigner for StubSigner {
    fn address(&self) -> Address {
        RESPONDER_ADDRESS
    }

    fn sign(&self, tx: &TransactionRequest) -> Result<Vec<u8>, SignerError> {
        serde_json::to_vec(tx).map_err(|e| SignerError::Unavailable(e.to_string()))
    }
}

/// Block `number` with hash `[tag; 32]` and parent `[parent_tag; 32]`.
#[must_use]
pub fn chain_block(number: u64, tag: u8, parent_tag: u8) -> Block {
    Block {
        hash: [tag; 32],
        number,
        parent_hash: [parent_tag; 32],
        transactions: vec![],
        logs: vec![],
    }
}

/// A transaction carrying `identifier`'s intent.
#[must_use]
pub fn response_tx(
    identifier: &ResponseIdentifier,
    from: Address,
    nonce: u64,
    block_number: u64,
) -> Transaction {
    let mut hash = [0u8; 32];
    hash[0] = 0xF0;
    hash[1] = nonce as u8;
    hash[2] = block_number as u8;
    Transaction {
        hash,
        from,
        to: Some(identifier.to),
        nonce,
        chain_id: identifier.chain_id,
        data: identifier.data.clone(),
        value: identifier.value,
        gas_limit: identifier.gas_limit,
        gas_price: 10,
        block_number,
    }
}

/// A log matching `topic0` in position 0.
#[must_use]
pub fn event_log(topic0: Hash256) -> Log {
    Log {
        address: [0x55; 20],
        topics: [Some(topic0), None, None, None],
        data: vec![],
        transaction_hash: [0x66; 32],
    }
}
