//! Drives the block cache from the chain.
//!
//! The processor ingests new-tip notifications, fetches blocks, backfills
//! missing ancestors until the new block attaches, promotes it to head and
//! runs the whole head turn (reducers, action dispatch, responder
//! maintenance, listeners) under one lock. That lock is the serial
//! executor of the pipeline: every state transition of the cache, the
//! anchor states and the gas queue happens inside a head turn, and only
//! provider calls, store commits and broadcasts may suspend within one.
//!
//! When a notification is further ahead than `max_depth` (startup after
//! downtime), the processor catches up in lockstep: each iteration fetches
//! at most `head + max_depth`, promotes, and repeats, so the cache's depth
//! invariant holds at every step.
//!
//! Transient chain errors (absent block, "unknown block", timeouts) are
//! logged and swallowed; the next notification retries. Anything else is a
//! bug or a fatal condition and propagates.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use futures::StreamExt;

use crate::cache::{AddResult, BlockCacheError, BlockItemStore, SharedBlockCache};
use crate::provider::{ChainProvider, ProviderError};
use crate::reducer::{ComponentSet, ReducerError};
use crate::responder::{MultiResponder, ResponderAction, ResponderError};
use crate::store::{batch_put_json, ItemStoreError, ItemStoreExt, WriteBatch};
use crate::types::{Block, Hash256};

const NAMESPACE: &str = "block-processor";
const HEAD_KEY: &[u8] = b"head";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Cache(#[from] BlockCacheError),

    #[error(transparent)]
    Store(#[from] ItemStoreError),

    #[error(transparent)]
    Reducer(#[from] ReducerError),

    #[error(transparent)]
    Responder(#[from] ResponderError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("processor is in state {0:?}, expected {1:?}")]
    InvalidState(ProcessorState, ProcessorState),
}

impl ProcessorError {
    /// Transient chain conditions are retried on the next notification.
    fn is_transient(&self) -> bool {
        matches!(self, Self::Provider(err) if err.is_transient())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ProcessorState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Synchronous observer of head promotions, called inside the head turn.
pub trait HeadListener: Send + Sync + 'static {
    fn new_head(&self, head_hash: &Hash256);
}

#[derive(Debug, Serialize, Deserialize)]
struct HeadPointer {
    head: u64,
}

/// Everything mutated during a head turn, behind the turn lock.
struct Turn {
    components: ComponentSet<Block, ResponderAction>,
    responder: MultiResponder,
    last_observed_hash: Option<Hash256>,
}

pub struct BlockProcessor {
    provider: Arc<dyn ChainProvider>,
    cache: SharedBlockCache<Block>,
    items: Arc<BlockItemStore>,
    turn: Mutex<Turn>,
    state: AtomicU8,
    listeners: SyncRwLock<Vec<(u64, Arc<dyn HeadListener>)>>,
    next_listener_id: AtomicU64,
}

impl BlockProcessor {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        cache: SharedBlockCache<Block>,
        items: Arc<BlockItemStore>,
        components: ComponentSet<Block, ResponderAction>,
        responder: MultiResponder,
    ) -> Self {
        Self {
            provider,
            cache,
            items,
            turn: Mutex::new(Turn { components, responder, last_observed_hash: None }),
            state: AtomicU8::new(ProcessorState::Stopped as u8),
            listeners: SyncRwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(
        &self,
        from: ProcessorState,
        to: ProcessorState,
    ) -> Result<(), ProcessorError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| ProcessorError::InvalidState(ProcessorState::from_u8(actual), from))
    }

    /// Registers a head listener. Only valid while running.
    pub fn add_listener(&self, listener: Arc<dyn HeadListener>) -> Result<u64, ProcessorError> {
        if self.state() != ProcessorState::Running {
            return Err(ProcessorError::InvalidState(self.state(), ProcessorState::Running));
        }
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        Ok(id)
    }

    /// Removes a head listener. Only valid while running.
    pub fn remove_listener(&self, id: u64) -> Result<bool, ProcessorError> {
        if self.state() != ProcessorState::Running {
            return Err(ProcessorError::InvalidState(self.state(), ProcessorState::Running));
        }
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        Ok(listeners.len() != before)
    }

    /// Restores persisted state (cache graph, responder queue) and
    /// returns the height to resume from. Must run exactly once, before
    /// any block is processed.
    pub async fn bootstrap(&self) -> Result<u64, ProcessorError> {
        self.transition(ProcessorState::Stopped, ProcessorState::Starting)?;

        self.restore_cache()?;
        {
            let mut turn = self.turn.lock().await;
            turn.responder.start().await?;
        }

        match self.items.raw().get_json::<HeadPointer>(NAMESPACE, HEAD_KEY)? {
            Some(pointer) => Ok(pointer.head),
            None => Ok(self.provider.block_number().await?),
        }
    }

    /// Starts the processor: restores persisted state, processes the
    /// resume height, then follows the provider's notifications until
    /// `shutdown` fires. Returns the handle of the subscription task.
    pub async fn start(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<tokio::task::JoinHandle<()>, ProcessorError> {
        let resume = self.bootstrap().await?;
        let stream = self.provider.subscribe_blocks().await?;
        self.transition(ProcessorState::Starting, ProcessorState::Running)?;
        info!(resume, "block processor running");

        if let Err(err) = self.process_block_number(resume).await {
            // the resume height may simply not be available yet
            if err.is_transient() {
                debug!(error = %err, "resume height not processable yet");
            } else {
                return Err(err);
            }
        }

        let processor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut stream = stream;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("block subscription removed");
                        break;
                    }
                    next = stream.next() => {
                        let Some(number) = next else {
                            warn!("provider block stream ended");
                            break;
                        };
                        if let Err(err) = processor.process_block_number(number).await {
                            error!(block = number, error = %err, "fatal error processing block");
                            break;
                        }
                    }
                }
            }
            // let the in-flight turn complete before declaring stopped
            let _ = processor.turn.lock().await;
            let _ = processor.transition(ProcessorState::Running, ProcessorState::Stopping);
            let _ = processor.transition(ProcessorState::Stopping, ProcessorState::Stopped);
            info!("block processor stopped");
        });
        Ok(handle)
    }

    /// Rebuilds the in-memory DAG from persisted block records and
    /// re-establishes the head so the depth window applies immediately.
    fn restore_cache(&self) -> Result<(), ProcessorError> {
        let mut records: Vec<Block> = self.items.load_block_records()?;
        if records.is_empty() {
            return Ok(());
        }
        records.sort_by_key(|b| b.number);

        let pruned_hashes = {
            let mut cache = self.cache.write();
            for block in &records {
                cache.add_block(block.clone());
            }
            // highest attached block resumes as head; the first
            // notification will re-promote the canonical tip anyway
            let resume_head = records
                .iter()
                .rev()
                .map(|b| b.hash)
                .find(|hash| cache.has_block(hash, true));
            match resume_head {
                Some(hash) => {
                    cache.set_head(&hash)?.iter().map(|b| b.hash).collect::<Vec<_>>()
                }
                None => Vec::new(),
            }
        };

        if !pruned_hashes.is_empty() {
            let mut batch = WriteBatch::new();
            for hash in &pruned_hashes {
                self.items.delete_block(&mut batch, hash)?;
            }
            self.items.commit(batch)?;
        }
        info!(blocks = self.cache.read().len(), "block cache restored");
        Ok(())
    }

    /// Ingests a tip notification, catching up in `max_depth` steps when
    /// the notification is far ahead. Transient chain errors are swallowed
    /// here; everything else propagates.
    pub async fn process_block_number(&self, notified: u64) -> Result<(), ProcessorError> {
        loop {
            let (target, behind) = {
                let cache = self.cache.read();
                match cache.head() {
                    None => (notified, false),
                    Some(head) => {
                        let cap = head.number + cache.max_depth();
                        if notified > cap {
                            (cap, true)
                        } else {
                            (notified, false)
                        }
                    }
                }
            };

            match self.process_target(target).await {
                Ok(()) => {}
                Err(err) if err.is_transient() => {
                    info!(block = target, error = %err, "transient chain error, will retry on next block");
                    return Ok(());
                }
                Err(err) => {
                    error!(block = target, error = %err, "error processing block");
                    return Err(err);
                }
            }

            if !behind {
                return Ok(());
            }
            debug!(target, notified, "catching up");
        }
    }

    /// One head turn: fetch, attach, promote, reduce, dispatch.
    async fn process_target(&self, target: u64) -> Result<(), ProcessorError> {
        let mut turn = self.turn.lock().await;

        let block = self
            .provider
            .block_by_number(target)
            .await?
            .ok_or(ProviderError::BlockNotAvailable)?;
        let head_hash = block.hash;

        if self.cache.read().has_block(&head_hash, false) {
            debug!(block = target, "block already known, no head update");
            return Ok(());
        }
        turn.last_observed_hash = Some(head_hash);

        // attach: walk parents until the chain connects or bottoms out at
        // the depth window
        let mut added = vec![block.clone()];
        let first_add = self.cache.write().add_block(block.clone());
        if first_add == AddResult::NotAddedBlockNumberTooLow {
            debug!(block = target, "notification below depth window");
            return Ok(());
        }

        let mut result = first_add;
        let mut cursor = block;
        while result.is_detached() {
            let parent_hash = cursor.parent_hash;
            let cached = {
                let cache = self.cache.read();
                cache.get_block(&parent_hash).ok().map(|arc| arc.as_ref().clone())
            };
            let parent = match cached {
                Some(parent) => parent,
                None => self
                    .provider
                    .block_by_hash(&parent_hash)
                    .await?
                    .ok_or(ProviderError::BlockNotAvailable)?,
            };
            result = self.cache.write().add_block(parent.clone());
            if matches!(result, AddResult::Added | AddResult::AddedDetached) {
                added.push(parent.clone());
            }
            cursor = parent;
        }

        // a newer notification may have raced us while we were fetching
        if turn.last_observed_hash != Some(head_hash) {
            debug!(block = target, "newer notification observed, skipping promotion");
            return Ok(());
        }

        self.promote(&mut turn, head_hash, added).await
    }

    /// Promotes `head_hash`: set_head + prune, run reducers, commit the
    /// turn's batch, dispatch actions, notify listeners. All under the
    /// turn lock.
    async fn promote(
        &self,
        turn: &mut Turn,
        head_hash: Hash256,
        added: Vec<Block>,
    ) -> Result<(), ProcessorError> {
        let mut batch = WriteBatch::new();
        for block in &added {
            self.items.put_block_record(&mut batch, &block.hash, block);
        }

        let (head_number, pruned_hashes) = {
            let mut cache = self.cache.write();
            let pruned = cache.set_head(&head_hash)?;
            let head_number = cache
                .head()
                .map(|h| h.number)
                .ok_or(BlockCacheError::BlockNotFound)?;
            (head_number, pruned.iter().map(|b| b.hash).collect::<Vec<_>>())
        };

        batch_put_json(&mut batch, NAMESPACE, HEAD_KEY, &HeadPointer { head: head_number });
        for hash in &pruned_hashes {
            self.items.delete_block(&mut batch, hash)?;
        }
        turn.components.forget_blocks(&pruned_hashes);

        let actions = {
            let cache = self.cache.read();
            turn.components.process_head(&head_hash, &cache, &mut batch)?
        };

        // store failure is fatal: the persisted view must never lag the
        // dispatched actions
        self.items.commit(batch)?;

        debug!(head = head_number, actions = actions.len(), "new head event");
        turn.responder.handle_actions(actions, head_number).await?;
        turn.responder.on_new_head(head_number).await?;

        for (_, listener) in self.listeners.read().iter() {
            listener.new_head(&head_hash);
        }
        Ok(())
    }
}
