//! Single-writer owner of the gas queue and the signing key.
//!
//! Components describe what should be true ("this appointment needs a
//! response", "this intent is mined"); the multi-responder is the only
//! code that turns those into queue mutations and broadcasts. Every
//! mutation is journalled before it takes effect so a restart rebuilds the
//! exact queue, and after every mutation the queue `difference` against
//! the previous value is (re)broadcast. The network acknowledgement is
//! advisory only: the reducer framework observing a mined transaction is
//! the sole source of truth for progress.
//!
//! Gas bumping: while an item stays un-mined, its gas price is multiplied
//! by a configured factor on every interval block, capped at
//! `max_gas_price`. At the cap the item is marked stuck and an operator-
//! facing error is logged, but re-broadcast continues.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::appointments::AppointmentRegistry;
use crate::provider::{ChainProvider, ProviderError};
use crate::store::{ItemStore, ItemStoreError, WriteBatch};
use crate::types::{AppointmentId, ResponseIdentifier, TransactionRequest};

use super::{
    GasQueue, GasQueueError, GasQueueItem, ResponderAction, ResponseRequest, SignerError,
    TransactionSigner,
};

const NAMESPACE: &str = "responder";
const JOURNAL_PREFIX: &[u8] = b"j:";

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error(transparent)]
    Store(#[from] ItemStoreError),

    #[error(transparent)]
    Queue(#[from] GasQueueError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("responder journal is corrupt: {0}")]
    CorruptJournal(String),
}

/// Replacement-pricing policy. The exact schedule is an operator choice;
/// the defaults follow the common 12.5% replacement minimum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasPolicy {
    /// Multiplier applied to an un-mined item's gas price per bump.
    pub bump_factor: f64,
    /// Blocks between bumps of the same item.
    pub bump_interval_blocks: u64,
    /// Hard ceiling in wei; reaching it marks the item stuck.
    pub max_gas_price: u128,
    /// Minimum gas price in wei for newly queued items.
    pub floor_gas_price: u128,
    /// Balance in wei below which the balance probe warns.
    pub low_balance_threshold: u128,
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self {
            bump_factor: 1.125,
            bump_interval_blocks: 1,
            max_gas_price: 2_000_000_000_000,
            floor_gas_price: 1_000_000_000,
            low_balance_threshold: 100_000_000_000_000_000,
        }
    }
}

impl GasPolicy {
    /// Next price for `current`, capped. Returns `None` at the cap.
    fn bumped(&self, current: u128) -> Option<u128> {
        if current >= self.max_gas_price {
            return None;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let raw = (current as f64 * self.bump_factor).ceil() as u128;
        Some(raw.max(current + 1).min(self.max_gas_price))
    }
}

/// One journalled queue mutation, or a snapshot superseding everything
/// before it.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalEntry {
    Add { request: ResponseRequest, gas_price: u128 },
    Consume { nonce: u64 },
    Bump { identifier: ResponseIdentifier, gas_price: u128 },
    Replace { items: Vec<GasQueueItem> },
    Snapshot { queue: GasQueue },
}

/// Lock-free health snapshot, refreshed after every mutation.
#[derive(Debug, Clone, Default)]
pub struct ResponderStatus {
    pub queue_depth: usize,
    pub pending_nonce: u64,
    pub highest_mined_nonce: Option<u64>,
    pub stuck_items: usize,
    pub last_broadcast_error: Option<String>,
}

fn journal_key(seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(JOURNAL_PREFIX.len() + 8);
    key.extend_from_slice(JOURNAL_PREFIX);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

pub struct MultiResponder {
    provider: Arc<dyn ChainProvider>,
    signer: Arc<dyn TransactionSigner>,
    store: Arc<dyn ItemStore>,
    registry: Arc<AppointmentRegistry>,
    policy: GasPolicy,
    chain_id: u64,
    snapshot_interval: u64,

    queue: GasQueue,
    journal_seq: u64,
    entries_since_snapshot: u64,
    highest_mined_nonce: Option<u64>,
    /// Block at which each item was last priced (enqueue or bump).
    last_priced: HashMap<ResponseIdentifier, u64>,
    /// Items at the gas cap that still have not mined.
    stuck: Vec<ResponseIdentifier>,
    /// Items whose last broadcast failed; retried on the next head.
    rebroadcast: Vec<ResponseIdentifier>,
    last_broadcast_error: Option<String>,
    status: Arc<ArcSwap<ResponderStatus>>,
}

impl MultiResponder {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        signer: Arc<dyn TransactionSigner>,
        store: Arc<dyn ItemStore>,
        registry: Arc<AppointmentRegistry>,
        policy: GasPolicy,
        chain_id: u64,
        snapshot_interval: u64,
    ) -> Self {
        let floor = policy.floor_gas_price;
        Self {
            provider,
            signer,
            store,
            registry,
            policy,
            chain_id,
            snapshot_interval: snapshot_interval.max(1),
            queue: GasQueue::new(0, floor),
            journal_seq: 0,
            entries_since_snapshot: 0,
            highest_mined_nonce: None,
            last_priced: HashMap::new(),
            stuck: Vec::new(),
            rebroadcast: Vec::new(),
            last_broadcast_error: None,
            status: Arc::new(ArcSwap::from_pointee(ResponderStatus::default())),
        }
    }

    /// Handle for lock-free health reads.
    #[must_use]
    pub fn status_handle(&self) -> Arc<ArcSwap<ResponderStatus>> {
        Arc::clone(&self.status)
    }

    #[must_use]
    pub fn queue(&self) -> &GasQueue {
        &self.queue
    }

    /// Restores the queue from the journal and aligns `base_nonce` with
    /// the remote transaction count. Must complete before the first head
    /// is replayed.
    pub async fn start(&mut self) -> Result<(), ResponderError> {
        let address = self.signer.address();
        let pending_nonce = self.provider.transaction_count(&address).await?;

        let (mut queue, next_seq) = self.replay_journal()?;
        self.journal_seq = next_seq;

        if queue.base_nonce() != pending_nonce {
            info!(
                journalled_base = queue.base_nonce(),
                remote = pending_nonce,
                "rebasing restored queue onto remote transaction count"
            );
            queue = self.rebase(&queue, pending_nonce);
        }
        self.queue = queue;
        self.write_snapshot()?;

        // everything restored is considered un-broadcast by this process
        self.rebroadcast =
            self.queue.items().iter().map(|item| item.identifier().clone()).collect();
        self.refresh_status();
        info!(
            queue_depth = self.queue.len(),
            base_nonce = self.queue.base_nonce(),
            "responder restored"
        );
        Ok(())
    }

    /// Applies one head's worth of component actions, in order. Store and
    /// signer failures are fatal; provider hiccups are logged and do not
    /// block later actions.
    pub async fn handle_actions(
        &mut self,
        actions: Vec<ResponderAction>,
        head_number: u64,
    ) -> Result<(), ResponderError> {
        for action in actions {
            match action {
                ResponderAction::StartResponse(id) => {
                    self.enqueue_appointment(&id, head_number).await?;
                }
                ResponderAction::ReEnqueueMissingItems(ids) => {
                    for id in ids {
                        self.enqueue_appointment(&id, head_number).await?;
                    }
                }
                ResponderAction::TxMined { identifier, nonce } => {
                    self.transaction_mined(&identifier, nonce).await?;
                }
                ResponderAction::CheckResponderBalance => self.check_balance().await,
                ResponderAction::EndResponse(id) => self.end_response(&id)?,
            }
        }
        self.refresh_status();
        Ok(())
    }

    /// Per-head maintenance: bump un-mined items per policy, then retry
    /// failed broadcasts.
    pub async fn on_new_head(&mut self, head_number: u64) -> Result<(), ResponderError> {
        let candidates: Vec<GasQueueItem> = self.queue.items().to_vec();
        for item in candidates {
            let identifier = item.identifier().clone();
            let due = self
                .last_priced
                .get(&identifier)
                .map_or(true, |last| head_number.saturating_sub(*last) >= self.policy.bump_interval_blocks);
            if !due {
                continue;
            }

            match self.policy.bumped(item.gas_price) {
                Some(new_price) => {
                    let next = self.queue.bump(&identifier, new_price)?;
                    let diff = self.commit_queue(
                        next,
                        JournalEntry::Bump { identifier: identifier.clone(), gas_price: new_price },
                    )?;
                    self.last_priced.insert(identifier, head_number);
                    self.broadcast_items(diff).await?;
                }
                None => {
                    if !self.stuck.contains(&identifier) {
                        self.stuck.push(identifier.clone());
                        error!(
                            appointment = ?item.request.appointment_id,
                            nonce = item.nonce,
                            gas_price = item.gas_price,
                            "gas price cap reached; response is stuck and needs operator attention"
                        );
                    }
                    // keep trying at the cap
                    self.rebroadcast_mark(&identifier);
                }
            }
        }

        let retries: Vec<ResponseIdentifier> = std::mem::take(&mut self.rebroadcast);
        if !retries.is_empty() {
            let items: Vec<GasQueueItem> = retries
                .iter()
                .filter_map(|id| self.queue.item_for(id).cloned())
                .collect();
            self.broadcast_items(items).await?;
        }
        self.refresh_status();
        Ok(())
    }

    async fn enqueue_appointment(
        &mut self,
        id: &AppointmentId,
        head_number: u64,
    ) -> Result<(), ResponderError> {
        let Some(appointment) = self.registry.get(id) else {
            debug!(appointment = ?id, "ignoring enqueue for unknown appointment");
            return Ok(());
        };
        if self.queue.contains_identifier(&appointment.identifier) {
            return Ok(());
        }

        let gas_price = match self.provider.gas_price().await {
            Ok(price) => price,
            Err(err) => {
                warn!(error = %err, "gas price probe failed, using floor");
                self.policy.floor_gas_price
            }
        };

        let request = ResponseRequest {
            appointment_id: appointment.id,
            deadline_block: appointment.end_block,
            identifier: appointment.identifier.clone(),
        };
        let gas_price_used = gas_price.max(self.policy.floor_gas_price);
        let next = match self.queue.add(request.clone(), gas_price) {
            Ok(next) => next,
            Err(GasQueueError::DuplicateIdentifier) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        info!(
            appointment = ?appointment.id,
            nonce = next.next_nonce() - 1,
            gas_price = gas_price_used,
            "response enqueued"
        );
        let diff = self.commit_queue(next, JournalEntry::Add { request, gas_price })?;
        self.last_priced.insert(appointment.identifier.clone(), head_number);
        self.broadcast_items(diff).await
    }

    async fn transaction_mined(
        &mut self,
        identifier: &ResponseIdentifier,
        nonce: u64,
    ) -> Result<(), ResponderError> {
        self.highest_mined_nonce =
            Some(self.highest_mined_nonce.map_or(nonce, |prev| prev.max(nonce)));
        self.last_priced.remove(identifier);
        self.stuck.retain(|id| id != identifier);
        self.rebroadcast.retain(|id| id != identifier);

        match self.queue.consume(nonce) {
            Ok(next) => {
                debug!(nonce, "queue consumed through mined nonce");
                let diff = self.commit_queue(next, JournalEntry::Consume { nonce })?;
                // anything sharing a consumed nonce was replaced by the
                // mined item and never needs broadcasting again
                self.broadcast_items(diff).await
            }
            Err(GasQueueError::NonceOutOfRange { .. }) if nonce < self.queue.base_nonce() => {
                // already consumed (duplicate notification); nothing to do
                Ok(())
            }
            Err(err) => {
                // A mined nonce we do not own: the chain disagrees with the
                // queue. Rebuild from the journal and the remote nonce.
                warn!(nonce, error = %err, "queue out of step with chain, recovering");
                self.recover().await
            }
        }
    }

    async fn check_balance(&mut self) {
        let address = self.signer.address();
        match self.provider.balance(&address).await {
            Ok(balance) if balance < self.policy.low_balance_threshold => {
                warn!(balance, threshold = self.policy.low_balance_threshold, "responder balance low");
            }
            Ok(balance) => debug!(balance, "responder balance ok"),
            Err(err) => debug!(error = %err, "balance probe failed"),
        }
    }

    fn end_response(&mut self, id: &AppointmentId) -> Result<(), ResponderError> {
        if let Some(appointment) = self.registry.get(id) {
            self.last_priced.remove(&appointment.identifier);
            self.stuck.retain(|i| i != &appointment.identifier);
            self.rebroadcast.retain(|i| i != &appointment.identifier);
        }
        let removed = self.registry.remove(id)?;
        if removed {
            info!(appointment = ?id, "response complete, tracking dropped");
        }
        Ok(())
    }

    /// Journal-then-mutate: the entry is durable before the in-memory
    /// queue moves, and the returned difference is what must be broadcast.
    fn commit_queue(
        &mut self,
        next: GasQueue,
        entry: JournalEntry,
    ) -> Result<Vec<GasQueueItem>, ResponderError> {
        self.journal_append(&entry)?;
        let diff = next.difference(&self.queue);
        self.queue = next;
        self.refresh_status();
        Ok(diff)
    }

    fn journal_append(&mut self, entry: &JournalEntry) -> Result<(), ResponderError> {
        let bytes = serde_json::to_vec(entry)
            .map_err(|e| ResponderError::CorruptJournal(e.to_string()))?;
        self.store.put(NAMESPACE, &journal_key(self.journal_seq), &bytes)?;
        self.journal_seq += 1;
        self.entries_since_snapshot += 1;

        if self.entries_since_snapshot >= self.snapshot_interval {
            self.write_snapshot()?;
        }
        Ok(())
    }

    /// Replaces the journal with a single snapshot of the current queue,
    /// atomically.
    fn write_snapshot(&mut self) -> Result<(), ResponderError> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.store.scan_prefix(NAMESPACE, JOURNAL_PREFIX)? {
            batch.delete(NAMESPACE, &key);
        }
        let entry = JournalEntry::Snapshot { queue: self.queue.clone() };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| ResponderError::CorruptJournal(e.to_string()))?;
        batch.put(NAMESPACE, &journal_key(self.journal_seq), bytes);
        self.store.commit(batch)?;
        self.journal_seq += 1;
        self.entries_since_snapshot = 0;
        Ok(())
    }

    fn replay_journal(&self) -> Result<(GasQueue, u64), ResponderError> {
        let mut queue = GasQueue::new(0, self.policy.floor_gas_price);
        let mut next_seq = 0u64;
        for (key, bytes) in self.store.scan_prefix(NAMESPACE, JOURNAL_PREFIX)? {
            let entry: JournalEntry = serde_json::from_slice(&bytes)
                .map_err(|e| ResponderError::CorruptJournal(e.to_string()))?;
            let seq_bytes: [u8; 8] = key[JOURNAL_PREFIX.len()..]
                .try_into()
                .map_err(|_| ResponderError::CorruptJournal("bad journal key".to_string()))?;
            next_seq = u64::from_be_bytes(seq_bytes) + 1;

            queue = match entry {
                JournalEntry::Snapshot { queue: snapshot } => snapshot,
                JournalEntry::Add { request, gas_price } => queue
                    .add(request, gas_price)
                    .map_err(|e| ResponderError::CorruptJournal(e.to_string()))?,
                JournalEntry::Consume { nonce } => queue
                    .consume(nonce)
                    .map_err(|e| ResponderError::CorruptJournal(e.to_string()))?,
                JournalEntry::Bump { identifier, gas_price } => queue
                    .bump(&identifier, gas_price)
                    .map_err(|e| ResponderError::CorruptJournal(e.to_string()))?,
                JournalEntry::Replace { items } => queue
                    .replace_from(items)
                    .map_err(|e| ResponderError::CorruptJournal(e.to_string()))?,
            };
        }
        Ok((queue, next_seq))
    }

    /// Re-assigns contiguous nonces from `base_nonce`, preserving order
    /// and pricing. Items whose nonce fell below the new base are dropped:
    /// the chain already holds a transaction at those nonces.
    fn rebase(&self, queue: &GasQueue, base_nonce: u64) -> GasQueue {
        let mut rebased = GasQueue::new(base_nonce, self.policy.floor_gas_price);
        for item in queue.items() {
            if item.nonce < base_nonce {
                continue;
            }
            match rebased.add(item.request.clone(), item.gas_price) {
                Ok(next) => rebased = next,
                Err(err) => {
                    warn!(error = %err, "dropping item during queue rebase");
                }
            }
        }
        rebased
    }

    /// Journal reload + remote nonce refresh, the recovery path for queue
    /// invariant violations.
    async fn recover(&mut self) -> Result<(), ResponderError> {
        let address = self.signer.address();
        let pending_nonce = self.provider.transaction_count(&address).await?;
        let (queue, next_seq) = self.replay_journal()?;
        self.journal_seq = next_seq;
        self.queue = self.rebase(&queue, pending_nonce);
        self.write_snapshot()?;
        self.rebroadcast =
            self.queue.items().iter().map(|item| item.identifier().clone()).collect();
        self.refresh_status();
        warn!(
            base_nonce = pending_nonce,
            queue_depth = self.queue.len(),
            "responder queue rebuilt from journal"
        );
        Ok(())
    }

    async fn broadcast_items(&mut self, items: Vec<GasQueueItem>) -> Result<(), ResponderError> {
        for item in items {
            let identifier = item.identifier().clone();
            let tx = TransactionRequest {
                to: identifier.to,
                value: identifier.value,
                data: identifier.data.clone(),
                gas_limit: identifier.gas_limit,
                gas_price: item.gas_price,
                nonce: item.nonce,
                chain_id: self.chain_id,
            };
            // signer loss is fatal; a failed send is retried next head
            let raw = self.signer.sign(&tx)?;
            match self.provider.send_raw_transaction(raw).await {
                Ok(tx_hash) => {
                    debug!(nonce = item.nonce, hash = ?tx_hash, "response broadcast");
                    self.rebroadcast.retain(|id| id != &identifier);
                    self.last_broadcast_error = None;
                }
                Err(err) => {
                    warn!(nonce = item.nonce, error = %err, "broadcast failed, will retry");
                    self.last_broadcast_error = Some(err.to_string());
                    self.rebroadcast_mark(&identifier);
                }
            }
        }
        self.refresh_status();
        Ok(())
    }

    fn rebroadcast_mark(&mut self, identifier: &ResponseIdentifier) {
        if !self.rebroadcast.contains(identifier) {
            self.rebroadcast.push(identifier.clone());
        }
    }

    fn refresh_status(&self) {
        self.status.store(Arc::new(ResponderStatus {
            queue_depth: self.queue.len(),
            pending_nonce: self.queue.base_nonce(),
            highest_mined_nonce: self.highest_mined_nonce,
            stuck_items: self.stuck.len(),
            last_broadcast_error: self.last_broadcast_error.clone(),
        }));
    }
}
