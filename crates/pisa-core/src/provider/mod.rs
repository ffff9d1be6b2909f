//! The chain interface the core consumes.
//!
//! Everything the pipeline knows about the chain arrives through
//! [`ChainProvider`]; the provider is injected at construction and owned by
//! the block processor. Errors are classified so the processor can swallow
//! the transient class (absent block, "unknown block" quirks, timeouts) and
//! escalate the rest.
//!
//! [`DelayedProvider`] shifts the observed chain tip back by a fixed number
//! of blocks, which trades response latency for immunity to shallow reorgs.

mod rpc;

pub use rpc::{JsonRpcProvider, JsonRpcProviderConfig};

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;

use crate::types::{Address, Block, Hash256, Receipt, TransactionRequest};

/// Errors surfaced by a chain provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The requested block does not (yet) exist from this provider's view.
    #[error("block not available")]
    BlockNotAvailable,

    /// Some providers answer "unknown block" for blocks they have not yet
    /// indexed; retrying later usually succeeds.
    #[error("unknown block")]
    UnknownBlock,

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// Transport-level failure (connection refused, reset, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The node rejected the request.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The node answered with something unparseable.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Whether the error class clears on its own and should be retried on
    /// the next block rather than escalated.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BlockNotAvailable | Self::UnknownBlock | Self::Timeout | Self::Transport(_)
        )
    }
}

/// Chain access required by the response pipeline.
#[async_trait]
pub trait ChainProvider: Send + Sync + 'static {
    /// Full block (transactions and logs) at `number`, `None` when the
    /// height has not been reached.
    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, ProviderError>;

    /// Full block by hash, `None` when unknown.
    async fn block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ProviderError>;

    /// Current tip height.
    async fn block_number(&self) -> Result<u64, ProviderError>;

    /// Receipt of a mined transaction, `None` while pending or unknown.
    async fn transaction_receipt(&self, tx_hash: &Hash256)
        -> Result<Option<Receipt>, ProviderError>;

    /// Confirmed transaction count (the next usable nonce) of `address`.
    async fn transaction_count(&self, address: &Address) -> Result<u64, ProviderError>;

    /// Current balance of `address` in wei.
    async fn balance(&self, address: &Address) -> Result<u128, ProviderError>;

    /// Current gas price suggestion in wei.
    async fn gas_price(&self) -> Result<u128, ProviderError>;

    /// Gas estimate for `tx`.
    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, ProviderError>;

    /// Broadcasts a signed transaction, returning its hash.
    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<Hash256, ProviderError>;

    /// Stream of new tip heights. The stream ends when the provider shuts
    /// down.
    async fn subscribe_blocks(&self) -> Result<BoxStream<'static, u64>, ProviderError>;
}

/// Provider adapter that reports the chain `delay` blocks behind the real
/// tip.
pub struct DelayedProvider<P> {
    inner: P,
    delay: u64,
}

impl<P: ChainProvider> DelayedProvider<P> {
    pub fn new(inner: P, delay: u64) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<P: ChainProvider> ChainProvider for DelayedProvider<P> {
    async fn block_by_number(&self, number: u64) -> Result<Option<Block>, ProviderError> {
        self.inner.block_by_number(number).await
    }

    async fn block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ProviderError> {
        self.inner.block_by_hash(hash).await
    }

    async fn block_number(&self) -> Result<u64, ProviderError> {
        let tip = self.inner.block_number().await?;
        if tip < self.delay {
            return Err(ProviderError::BlockNotAvailable);
        }
        Ok(tip - self.delay)
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &Hash256,
    ) -> Result<Option<Receipt>, ProviderError> {
        self.inner.transaction_receipt(tx_hash).await
    }

    async fn transaction_count(&self, address: &Address) -> Result<u64, ProviderError> {
        self.inner.transaction_count(address).await
    }

    async fn balance(&self, address: &Address) -> Result<u128, ProviderError> {
        self.inner.balance(address).await
    }

    async fn gas_price(&self) -> Result<u128, ProviderError> {
        self.inner.gas_price().await
    }

    async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64, ProviderError> {
        self.inner.estimate_gas(tx).await
    }

    async fn send_raw_transaction(&self, raw: Vec<u8>) -> Result<Hash256, ProviderError> {
        self.inner.send_raw_transaction(raw).await
    }

    async fn subscribe_blocks(&self) -> Result<BoxStream<'static, u64>, ProviderError> {
        let delay = self.delay;
        let stream = self.inner.subscribe_blocks().await?;
        Ok(stream.filter_map(move |n| async move { n.checked_sub(delay) }).boxed())
    }
}
