//! Promise-style confirmation tracking.
//!
//! Callers register interest in a transaction hash and await the handle;
//! the registration is evaluated against the block cache on every new
//! head and settles exactly once: `Ok` at the requested confirmation
//! depth, or an error on reorg or when a block threshold lapses.
//! Cancellation removes the registration synchronously; after `cancel`
//! returns no further evaluation can touch it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::cache::SharedBlockCache;
use crate::types::{Block, Hash256};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfirmationError {
    /// The transaction is no longer in the ancestry of the head.
    #[error("transaction disappeared from the canonical chain")]
    Reorg,

    /// The transaction did not reach the requested depth within the
    /// configured number of heads.
    #[error("confirmation wait exceeded its block threshold")]
    BlockThresholdExceeded,

    /// The observer was dropped or the registration cancelled.
    #[error("confirmation wait cancelled")]
    Cancelled,
}

/// How a registration should fail.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationPolicy {
    /// Give up after this many further heads without enough confirmations.
    pub block_threshold: Option<u64>,
    /// Treat "not found on the canonical branch" as a reorg error. Set
    /// this when the transaction is already known to be mined.
    pub reorg_if_not_found: bool,
}

struct Registration {
    tx_hash: Hash256,
    confirmations_required: u32,
    blocks_remaining: Option<u64>,
    reorg_if_not_found: bool,
    sender: oneshot::Sender<Result<(), ConfirmationError>>,
}

/// Evaluates confirmation registrations on every new head.
pub struct ConfirmationObserver {
    cache: SharedBlockCache<Block>,
    registrations: Arc<DashMap<u64, Registration>>,
    next_id: AtomicU64,
}

impl ConfirmationObserver {
    pub fn new(cache: SharedBlockCache<Block>) -> Self {
        Self { cache, registrations: Arc::new(DashMap::new()), next_id: AtomicU64::new(0) }
    }

    /// Registers interest in `tx_hash` reaching `confirmations_required`
    /// confirmations. The returned handle settles on a later head.
    pub fn wait_for_confirmations(
        &self,
        tx_hash: Hash256,
        confirmations_required: u32,
        policy: ConfirmationPolicy,
    ) -> ConfirmationHandle {
        let (sender, receiver) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registrations.insert(
            id,
            Registration {
                tx_hash,
                confirmations_required,
                blocks_remaining: policy.block_threshold,
                reorg_if_not_found: policy.reorg_if_not_found,
                sender,
            },
        );
        ConfirmationHandle { id, registrations: Arc::clone(&self.registrations), receiver }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.registrations.len()
    }

    /// Evaluates every registration against the new head, settling those
    /// that are decided.
    pub fn on_new_head(&self, head_hash: &Hash256) {
        let cache = self.cache.read();

        let mut settled: Vec<(u64, Result<(), ConfirmationError>)> = Vec::new();
        for mut entry in self.registrations.iter_mut() {
            let id = *entry.key();
            let registration = entry.value_mut();
            let confirmations = cache.get_confirmations(head_hash, &registration.tx_hash);

            if confirmations == 0 && registration.reorg_if_not_found {
                settled.push((id, Err(ConfirmationError::Reorg)));
                continue;
            }
            if confirmations >= registration.confirmations_required {
                settled.push((id, Ok(())));
                continue;
            }
            if let Some(remaining) = &mut registration.blocks_remaining {
                if *remaining == 0 {
                    settled.push((id, Err(ConfirmationError::BlockThresholdExceeded)));
                } else {
                    *remaining -= 1;
                }
            }
        }
        drop(cache);

        for (id, outcome) in settled {
            if let Some((_, registration)) = self.registrations.remove(&id) {
                debug!(tx = ?registration.tx_hash, ok = outcome.is_ok(), "confirmation wait settled");
                // receiver may have been dropped; nothing to do then
                let _ = registration.sender.send(outcome);
            }
        }
    }
}

/// Awaitable, cancellable confirmation wait.
pub struct ConfirmationHandle {
    id: u64,
    registrations: Arc<DashMap<u64, Registration>>,
    receiver: oneshot::Receiver<Result<(), ConfirmationError>>,
}

impl ConfirmationHandle {
    /// Removes the registration; no evaluation after this call can settle
    /// the handle.
    pub fn cancel(&self) {
        self.registrations.remove(&self.id);
    }

    /// Waits for the registration to settle.
    pub async fn wait(self) -> Result<(), ConfirmationError> {
        self.receiver.await.unwrap_or(Err(ConfirmationError::Cancelled))
    }
}
