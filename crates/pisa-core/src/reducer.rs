//! Anchor-state reducer framework.
//!
//! Every watching component expresses its per-block state as a pure fold
//! over ancestry: `initial(block)` seeds the state at the deepest block the
//! component can see, and `reduce(prev, block)` advances it one block. The
//! framework memoizes the fold per `(component, block hash)`, in memory
//! and on the block item store, so the state observed at any cached block
//! is a deterministic function of that block, survives restarts, and is
//! cheap to recall.
//!
//! On a new head the framework computes the head's state, diffs it against
//! the state at the previous head via the component's `detect_changes`, and
//! returns the resulting actions for dispatch. When the previous head is
//! not an ancestor of the new head (a reorg), the diff base is the state at
//! the nearest common ancestor: diffs cross the fork point, never a stale
//! branch.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::cache::{BlockCache, BlockItemStore};
use crate::store::{ItemStoreError, WriteBatch};
use crate::types::{BlockIdentity, Hash256};

/// Item name under which each component's anchor states are persisted.
pub const ANCHOR_STATE_ITEM: &str = "anchor-state";

#[derive(Debug, Error)]
pub enum ReducerError {
    /// A block required for the fold disappeared from the cache. This is a
    /// framework bug, not a chain condition.
    #[error("block missing from cache during anchor-state computation")]
    MissingBlock,

    #[error(transparent)]
    Store(#[from] ItemStoreError),
}

/// A pure fold over block ancestry.
///
/// `reduce` must be total: it has no error channel, and a panic here is a
/// component bug that takes the service down by design.
pub trait AnchorStateReducer<B: BlockIdentity>: Send + 'static {
    type State: Clone
        + Default
        + PartialEq
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// State at the first block this component can see. `cache` grants
    /// read access to the (immutable) ancestry of `block`.
    fn initial(&self, block: &B, cache: &BlockCache<B>) -> Self::State;

    /// State transition for one block.
    fn reduce(&self, prev: &Self::State, block: &B, cache: &BlockCache<B>) -> Self::State;
}

/// A reducer that also knows how to turn a state change into actions.
pub trait Component<B: BlockIdentity>: AnchorStateReducer<B> {
    type Action: Send + 'static;

    /// Namespace for persisted anchor states; stable across restarts.
    fn name(&self) -> &'static str;

    /// Actions implied by moving the observed head from `prev` to `next`.
    /// Must be pure; the returned order is the dispatch order.
    fn detect_changes(&self, prev: &Self::State, next: &Self::State) -> Vec<Self::Action>;
}

trait ErasedComponent<B: BlockIdentity, A>: Send {
    fn process_head(
        &mut self,
        head: &Hash256,
        cache: &BlockCache<B>,
        items: &BlockItemStore,
        batch: &mut WriteBatch,
    ) -> Result<Vec<A>, ReducerError>;

    fn forget_blocks(&mut self, pruned: &[Hash256]);
}

struct ComponentRunner<B: BlockIdentity, C: Component<B>> {
    component: C,
    memo: HashMap<Hash256, Arc<C::State>>,
    prev_head: Option<Hash256>,
}

impl<B: BlockIdentity, C: Component<B>> ComponentRunner<B, C> {
    /// Memoized fold: returns the anchor state at `hash`, computing and
    /// caching any missing prefix of the ancestry.
    fn state_at(
        &mut self,
        hash: &Hash256,
        cache: &BlockCache<B>,
        items: &BlockItemStore,
        batch: &mut WriteBatch,
    ) -> Result<Arc<C::State>, ReducerError> {
        if let Some(state) = self.memo.get(hash) {
            return Ok(Arc::clone(state));
        }

        // Walk back until a known state or the deepest attached ancestor.
        let mut chain: Vec<Arc<B>> = Vec::new();
        let mut base: Option<Arc<C::State>> = None;
        let mut cursor = *hash;
        loop {
            if let Some(state) = self.memo.get(&cursor) {
                base = Some(Arc::clone(state));
                break;
            }
            if let Some(state) =
                items.get_item::<C::State>(self.component.name(), &cursor, ANCHOR_STATE_ITEM)?
            {
                let state = Arc::new(state);
                self.memo.insert(cursor, Arc::clone(&state));
                base = Some(state);
                break;
            }
            let block =
                Arc::clone(cache.get_block(&cursor).map_err(|_| ReducerError::MissingBlock)?);
            let parent = *block.parent_hash();
            chain.push(block);
            if cache.has_block(&parent, true) {
                cursor = parent;
            } else {
                break;
            }
        }

        let mut state = match base {
            Some(state) => state,
            None => {
                let Some(root) = chain.pop() else { return Err(ReducerError::MissingBlock) };
                trace!(component = self.component.name(), number = root.number(), "initializing anchor state");
                let state = Arc::new(self.component.initial(root.as_ref(), cache));
                self.remember(items, batch, root.hash(), &state);
                state
            }
        };

        while let Some(block) = chain.pop() {
            state = Arc::new(self.component.reduce(&state, block.as_ref(), cache));
            self.remember(items, batch, block.hash(), &state);
        }
        Ok(state)
    }

    fn remember(
        &mut self,
        items: &BlockItemStore,
        batch: &mut WriteBatch,
        hash: &Hash256,
        state: &Arc<C::State>,
    ) {
        items.put_item(batch, self.component.name(), hash, ANCHOR_STATE_ITEM, state.as_ref());
        self.memo.insert(*hash, Arc::clone(state));
    }
}

impl<B: BlockIdentity, C: Component<B>> ErasedComponent<B, C::Action> for ComponentRunner<B, C> {
    fn process_head(
        &mut self,
        head: &Hash256,
        cache: &BlockCache<B>,
        items: &BlockItemStore,
        batch: &mut WriteBatch,
    ) -> Result<Vec<C::Action>, ReducerError> {
        let next = self.state_at(head, cache, items, batch)?;

        // Normal advance: the previous head is the common ancestor of
        // itself and the new head, so one lookup covers both cases.
        let prev = match &self.prev_head {
            None => None,
            Some(prev_head) => match cache.common_ancestor(head, prev_head) {
                Some(ancestor) => Some(self.state_at(&ancestor, cache, items, batch)?),
                None => None,
            },
        };

        let empty = C::State::default();
        let actions = self.component.detect_changes(prev.as_deref().unwrap_or(&empty), &next);
        self.prev_head = Some(*head);
        Ok(actions)
    }

    fn forget_blocks(&mut self, pruned: &[Hash256]) {
        for hash in pruned {
            self.memo.remove(hash);
        }
    }
}

/// The registered components of the pipeline, run in registration order on
/// every new head.
pub struct ComponentSet<B: BlockIdentity, A> {
    items: Arc<BlockItemStore>,
    runners: Vec<Box<dyn ErasedComponent<B, A>>>,
}

impl<B: BlockIdentity, A: Send + 'static> ComponentSet<B, A> {
    pub fn new(items: Arc<BlockItemStore>) -> Self {
        Self { items, runners: Vec::new() }
    }

    pub fn register<C>(&mut self, component: C)
    where
        C: Component<B, Action = A>,
    {
        self.items.register_component(component.name());
        self.runners.push(Box::new(ComponentRunner {
            component,
            memo: HashMap::new(),
            prev_head: None,
        }));
    }

    /// Runs every component against the new head, buffering anchor-state
    /// writes into `batch`, and returns the concatenated actions in
    /// registration order.
    pub fn process_head(
        &mut self,
        head: &Hash256,
        cache: &BlockCache<B>,
        batch: &mut WriteBatch,
    ) -> Result<Vec<A>, ReducerError> {
        let mut actions = Vec::new();
        for runner in &mut self.runners {
            actions.extend(runner.process_head(head, cache, &self.items, batch)?);
        }
        Ok(actions)
    }

    /// Drops memoized states for pruned blocks; their persisted copies are
    /// deleted by the caller in the same batch as the blocks themselves.
    pub fn forget_blocks(&mut self, pruned: &[Hash256]) {
        for runner in &mut self.runners {
            runner.forget_blocks(pruned);
        }
    }
}
