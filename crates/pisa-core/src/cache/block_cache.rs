//! Reorg-aware cache of recent blocks.
//!
//! The cache is a bounded-depth DAG: a `hash → block` map, a `number →
//! hashes` index (siblings from competing forks sit at the same height),
//! and a single designated head. `minimum_height` is always
//! `head.number - max_depth`; blocks at or below it are rejected on add
//! and pruned on head advance.
//!
//! # Attachment
//!
//! A block is *attached* when it chains through stored blocks to a root.
//! Roots are the first blocks seen while the cache has no head, and blocks
//! entering at `minimum_height + 1` once it does (their parent can never be
//! added, so they are accepted as attached-by-depth). Detached blocks are
//! tolerated while their ancestors are still being fetched; adding the
//! missing parent re-attaches the whole waiting subtree. Anchor-state
//! computation never observes a detached block.
//!
//! ```text
//!            ┌── 103a ── 104a        head = 104a, max_depth = 3
//!  101 ── 102┤                       minimum_height = 101
//!            └── 103b                103b is an attached sibling
//!
//!  107 (detached: 106 not yet fetched)
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use thiserror::Error;
use tracing::{debug, trace};

use crate::types::{BlockIdentity, Hash256, TransactionContainer};

/// Outcome of [`BlockCache::add_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// Fresh insert, chained to a stored ancestor.
    Added,
    /// Fresh insert, parent not (yet) stored.
    AddedDetached,
    /// Already stored and attached; cache unchanged.
    NotAddedAlreadyExistedAttached,
    /// Already stored, still detached; cache unchanged.
    NotAddedAlreadyExistedDetached,
    /// Below the depth window; cache unchanged.
    NotAddedBlockNumberTooLow,
}

impl AddResult {
    /// Whether the block is stored but not attached after this call.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        matches!(self, Self::AddedDetached | Self::NotAddedAlreadyExistedDetached)
    }
}

#[derive(Debug, Error)]
pub enum BlockCacheError {
    #[error("max_depth must be positive")]
    InvalidMaxDepth,
    #[error("block is not in the cache")]
    BlockNotFound,
    #[error("set_head target is not in the cache")]
    UnknownHead,
    #[error("set_head target is detached")]
    DetachedHead,
}

struct CachedEntry<B> {
    block: Arc<B>,
    attached: bool,
}

/// Bounded-depth DAG of recent blocks with a designated head.
pub struct BlockCache<B: BlockIdentity> {
    max_depth: u64,
    blocks: HashMap<Hash256, CachedEntry<B>>,
    by_number: BTreeMap<u64, HashSet<Hash256>>,
    head: Option<Hash256>,
}

impl<B: BlockIdentity> BlockCache<B> {
    /// Creates an empty cache retaining at most `max_depth` blocks behind
    /// the head.
    pub fn new(max_depth: u64) -> Result<Self, BlockCacheError> {
        if max_depth == 0 {
            return Err(BlockCacheError::InvalidMaxDepth);
        }
        Ok(Self { max_depth, blocks: HashMap::new(), by_number: BTreeMap::new(), head: None })
    }

    #[must_use]
    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// The current head block, if one has been promoted.
    #[must_use]
    pub fn head(&self) -> Option<&Arc<B>> {
        self.head.as_ref().and_then(|h| self.blocks.get(h)).map(|e| &e.block)
    }

    /// Height at and below which blocks are outside the window. Undefined
    /// until a head has been promoted.
    #[must_use]
    pub fn minimum_height(&self) -> Option<u64> {
        self.head().map(|h| h.number().saturating_sub(self.max_depth))
    }

    #[must_use]
    pub fn has_block(&self, hash: &Hash256, must_be_attached: bool) -> bool {
        match self.blocks.get(hash) {
            Some(entry) => entry.attached || !must_be_attached,
            None => false,
        }
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<&Arc<B>, BlockCacheError> {
        self.blocks.get(hash).map(|e| &e.block).ok_or(BlockCacheError::BlockNotFound)
    }

    /// Inserts a block, classifying the outcome. Never mutates the cache
    /// for any `NotAdded*` outcome.
    pub fn add_block(&mut self, block: B) -> AddResult {
        let hash = *block.hash();
        let number = block.number();

        if let Some(min) = self.minimum_height() {
            if number <= min {
                trace!(number, minimum_height = min, "rejecting block below window");
                return AddResult::NotAddedBlockNumberTooLow;
            }
        }

        if let Some(entry) = self.blocks.get(&hash) {
            return if entry.attached {
                AddResult::NotAddedAlreadyExistedAttached
            } else {
                AddResult::NotAddedAlreadyExistedDetached
            };
        }

        let attached = match self.blocks.get(block.parent_hash()) {
            Some(parent) => parent.attached,
            // No stored parent: a root while the cache is headless, or an
            // attached-by-depth root at the floor of the window.
            None => {
                self.head.is_none() ||
                    self.minimum_height().is_some_and(|min| number == min + 1)
            }
        };

        self.blocks.insert(hash, CachedEntry { block: Arc::new(block), attached });
        self.by_number.entry(number).or_default().insert(hash);

        if attached {
            self.attach_descendants(&hash, number);
            trace!(number, "block added");
            AddResult::Added
        } else {
            trace!(number, "block added detached");
            AddResult::AddedDetached
        }
    }

    /// Marks every stored descendant of a newly attached block as attached.
    fn attach_descendants(&mut self, hash: &Hash256, number: u64) {
        let mut worklist = vec![(*hash, number)];
        while let Some((parent_hash, parent_number)) = worklist.pop() {
            let Some(children) = self.by_number.get(&(parent_number + 1)) else { continue };
            let children: Vec<Hash256> = children
                .iter()
                .filter(|h| {
                    self.blocks
                        .get(*h)
                        .is_some_and(|e| !e.attached && *e.block.parent_hash() == parent_hash)
                })
                .copied()
                .collect();
            for child in children {
                if let Some(entry) = self.blocks.get_mut(&child) {
                    entry.attached = true;
                    worklist.push((child, parent_number + 1));
                }
            }
        }
    }

    /// Promotes `hash` to head, recomputes `minimum_height` and prunes the
    /// window. Returns the pruned blocks so the caller can drop their
    /// derived items in the same store batch.
    ///
    /// # Errors
    ///
    /// The target must be stored and attached; anything else is a caller
    /// bug surfaced as a typed error.
    pub fn set_head(&mut self, hash: &Hash256) -> Result<Vec<Arc<B>>, BlockCacheError> {
        let entry = self.blocks.get(hash).ok_or(BlockCacheError::UnknownHead)?;
        if !entry.attached {
            return Err(BlockCacheError::DetachedHead);
        }
        let head_number = entry.block.number();
        self.head = Some(*hash);

        let min = head_number.saturating_sub(self.max_depth);
        let pruned = self.prune_below(min);
        debug!(head = head_number, minimum_height = min, pruned = pruned.len(), "head advanced");
        Ok(pruned)
    }

    /// Removes every block at height `<= min`, then transitively removes
    /// detached blocks that can no longer attach: those at `min + 1`
    /// (their parent is below the window forever) and detached descendants
    /// of anything removed this pass. Idempotent.
    fn prune_below(&mut self, min: u64) -> Vec<Arc<B>> {
        let mut pruned: Vec<Arc<B>> = Vec::new();
        let mut pruned_hashes: HashSet<Hash256> = HashSet::new();

        let low_heights: Vec<u64> =
            self.by_number.range(..=min).map(|(n, _)| *n).collect();
        for number in low_heights {
            if let Some(hashes) = self.by_number.remove(&number) {
                for hash in hashes {
                    if let Some(entry) = self.blocks.remove(&hash) {
                        pruned_hashes.insert(hash);
                        pruned.push(entry.block);
                    }
                }
            }
        }

        // Ascending sweep lets orphan removal cascade through a hanging
        // detached chain in one pass.
        let remaining_heights: Vec<u64> = self.by_number.keys().copied().collect();
        for number in remaining_heights {
            let Some(hashes) = self.by_number.get(&number) else { continue };
            let doomed: Vec<Hash256> = hashes
                .iter()
                .filter(|h| {
                    self.blocks.get(*h).is_some_and(|e| {
                        !e.attached &&
                            (number == min + 1 || pruned_hashes.contains(e.block.parent_hash()))
                    })
                })
                .copied()
                .collect();
            for hash in doomed {
                if let Some(entry) = self.blocks.remove(&hash) {
                    debug!(number = entry.block.number(), "pruning unattachable block");
                    pruned_hashes.insert(hash);
                    pruned.push(entry.block);
                }
                if let Some(set) = self.by_number.get_mut(&number) {
                    set.remove(&hash);
                    if set.is_empty() {
                        self.by_number.remove(&number);
                    }
                }
            }
        }

        pruned
    }

    /// Lazy walk from `hash` back through stored ancestors, starting with
    /// `hash` itself.
    pub fn ancestry<'a>(&'a self, hash: &Hash256) -> Ancestry<'a, B> {
        Ancestry { cache: self, cursor: Some(*hash) }
    }

    /// First block in the ancestry of `hash` satisfying `predicate`,
    /// not descending below `min_height`.
    pub fn find_ancestor(
        &self,
        hash: &Hash256,
        predicate: impl Fn(&B) -> bool,
        min_height: Option<u64>,
    ) -> Option<Arc<B>> {
        self.ancestry(hash)
            .take_while(|b| min_height.is_none_or(|min| b.number() >= min))
            .find(|b| predicate(b.as_ref()))
            .cloned()
    }

    /// Hash of the nearest common ancestor of `a` and `b`, walking only
    /// stored blocks. `None` when the ancestries never meet in the cache.
    pub fn common_ancestor(&self, a: &Hash256, b: &Hash256) -> Option<Hash256> {
        let b_ancestors: HashSet<Hash256> = self.ancestry(b).map(|blk| *blk.hash()).collect();
        self.ancestry(a).map(|blk| *blk.hash()).find(|h| b_ancestors.contains(h))
    }

    /// Whether `ancestor` appears in the stored ancestry of `descendant`
    /// (inclusive).
    #[must_use]
    pub fn is_ancestor(&self, descendant: &Hash256, ancestor: &Hash256) -> bool {
        self.ancestry(descendant).any(|b| b.hash() == ancestor)
    }
}

impl<B: TransactionContainer> BlockCache<B> {
    /// Number of blocks from `head_hash` (inclusive) back to and including
    /// the block containing `tx_hash`, walking only the ancestry of
    /// `head_hash`. `0` when the transaction is not on that branch.
    #[must_use]
    pub fn get_confirmations(&self, head_hash: &Hash256, tx_hash: &Hash256) -> u32 {
        for (depth, block) in self.ancestry(head_hash).enumerate() {
            if block.contains_transaction(tx_hash) {
                return u32::try_from(depth + 1).unwrap_or(u32::MAX);
            }
        }
        0
    }
}

/// Iterator over stored ancestors, oldest-last.
pub struct Ancestry<'a, B: BlockIdentity> {
    cache: &'a BlockCache<B>,
    cursor: Option<Hash256>,
}

impl<'a, B: BlockIdentity> Iterator for Ancestry<'a, B> {
    type Item = &'a Arc<B>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.cursor.take()?;
        let entry = self.cache.blocks.get(&hash)?;
        self.cursor = Some(*entry.block.parent_hash());
        Some(&entry.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockStub;

    fn stub(number: u64, tag: u8, parent_tag: u8) -> BlockStub {
        BlockStub { hash: [tag; 32], number, parent_hash: [parent_tag; 32] }
    }

    /// Builds a cache holding the chain `start..=end` with hash tag ==
    /// block number (mod 256) and head at `end`.
    fn chain_cache(start: u64, end: u64, max_depth: u64) -> BlockCache<BlockStub> {
        let mut cache = BlockCache::new(max_depth).expect("valid depth");
        for n in start..=end {
            let result = cache.add_block(stub(n, n as u8, n.wrapping_sub(1) as u8));
            assert!(
                matches!(result, AddResult::Added | AddResult::AddedDetached),
                "block {n} not inserted: {result:?}"
            );
            cache.set_head(&[n as u8; 32]).expect("set head");
        }
        cache
    }

    /// Parent-presence invariant: every attached block above the deepest
    /// layer has its parent stored.
    fn assert_parent_presence(cache: &BlockCache<BlockStub>) {
        let Some(min) = cache.minimum_height() else { return };
        for entry in cache.blocks.values() {
            if entry.attached && entry.block.number() > min + 1 {
                assert!(
                    cache.blocks.contains_key(&entry.block.parent_hash),
                    "attached block {} is missing its parent",
                    entry.block.number()
                );
            }
        }
    }

    #[test]
    fn zero_depth_is_rejected() {
        assert!(matches!(BlockCache::<BlockStub>::new(0), Err(BlockCacheError::InvalidMaxDepth)));
    }

    #[test]
    fn first_block_attaches_as_root() {
        let mut cache = BlockCache::new(5).expect("valid depth");
        assert_eq!(cache.add_block(stub(100, 1, 0)), AddResult::Added);
        assert!(cache.has_block(&[1u8; 32], true));
        assert!(cache.head().is_none());
    }

    #[test]
    fn add_is_idempotent() {
        let mut cache = BlockCache::new(5).expect("valid depth");
        assert_eq!(cache.add_block(stub(100, 1, 0)), AddResult::Added);
        assert_eq!(cache.add_block(stub(100, 1, 0)), AddResult::NotAddedAlreadyExistedAttached);
        assert_eq!(cache.len(), 1);

        // detached insert, twice
        assert_eq!(cache.add_block(stub(105, 9, 8)), AddResult::AddedDetached);
        assert_eq!(cache.add_block(stub(105, 9, 8)), AddResult::NotAddedAlreadyExistedDetached);
    }

    #[test]
    fn adding_missing_parent_attaches_waiting_subtree() {
        let mut cache = BlockCache::new(10).expect("valid depth");
        assert_eq!(cache.add_block(stub(1, 1, 0)), AddResult::Added);
        cache.set_head(&[1u8; 32]).expect("set head");

        // grandchild and child arrive before their ancestor chain is complete
        assert_eq!(cache.add_block(stub(4, 4, 3)), AddResult::AddedDetached);
        assert_eq!(cache.add_block(stub(3, 3, 2)), AddResult::AddedDetached);
        assert!(!cache.has_block(&[4u8; 32], true));

        // the bridging block attaches everything above it
        assert_eq!(cache.add_block(stub(2, 2, 1)), AddResult::Added);
        assert!(cache.has_block(&[3u8; 32], true));
        assert!(cache.has_block(&[4u8; 32], true));
    }

    #[test]
    fn add_below_window_is_rejected() {
        let cache_head = 100u64;
        let mut cache = chain_cache(95, cache_head, 10);
        // minimum_height = 90; 80 and 90 are both out
        assert_eq!(cache.add_block(stub(80, 200, 199)), AddResult::NotAddedBlockNumberTooLow);
        assert_eq!(cache.add_block(stub(90, 201, 200)), AddResult::NotAddedBlockNumberTooLow);
        assert_eq!(cache.add_block(stub(91, 202, 200)), AddResult::Added);
    }

    #[test]
    fn set_head_prunes_window() {
        let mut cache = chain_cache(1, 30, 10);
        // head 30 → minimum_height 20 → blocks 1..=20 pruned
        assert!(!cache.has_block(&[20u8; 32], false));
        assert!(cache.has_block(&[21u8; 32], true));
        assert_eq!(cache.head().expect("head").number, 30);
        assert_parent_presence(&cache);
    }

    #[test]
    fn set_head_requires_known_attached_block() {
        let mut cache = BlockCache::new(5).expect("valid depth");
        cache.add_block(stub(1, 1, 0));
        assert!(matches!(cache.set_head(&[99u8; 32]), Err(BlockCacheError::UnknownHead)));

        cache.set_head(&[1u8; 32]).expect("set head");
        cache.add_block(stub(4, 4, 3));
        assert!(matches!(cache.set_head(&[4u8; 32]), Err(BlockCacheError::DetachedHead)));
    }

    #[test]
    fn attached_by_depth_root_survives_prune() {
        let mut cache = chain_cache(1, 20, 10);
        // a sibling entering exactly at minimum_height + 1 is a root
        assert_eq!(cache.add_block(stub(11, 211, 210)), AddResult::Added);
        assert!(cache.has_block(&[211u8; 32], true));
        assert_parent_presence(&cache);
    }

    #[test]
    fn unattachable_detached_chain_is_pruned() {
        let mut cache = chain_cache(1, 15, 10);
        // detached chain waiting on an ancestor that will fall out of the window
        assert_eq!(cache.add_block(stub(7, 107, 106)), AddResult::AddedDetached);
        assert_eq!(cache.add_block(stub(8, 108, 107)), AddResult::AddedDetached);

        // head 16 → minimum_height 6 → the parent of 7 can never be added;
        // 7 and its detached descendant 8 are swept together
        cache.add_block(stub(16, 16, 15));
        cache.set_head(&[16u8; 32]).expect("set head");
        assert!(!cache.has_block(&[107u8; 32], false));
        assert!(!cache.has_block(&[108u8; 32], false));
        assert_parent_presence(&cache);
    }

    #[test]
    fn detached_block_awaiting_fetchable_parent_survives_prune() {
        let mut cache = chain_cache(1, 15, 10);
        // parent (number 13) is inside the window and may still arrive
        assert_eq!(cache.add_block(stub(14, 114, 113)), AddResult::AddedDetached);

        cache.add_block(stub(16, 16, 15));
        cache.set_head(&[16u8; 32]).expect("set head");
        assert!(cache.has_block(&[114u8; 32], false));
        assert!(!cache.has_block(&[114u8; 32], true));
    }

    #[test]
    fn pruning_is_idempotent() {
        let mut cache = chain_cache(1, 30, 10);
        let before = cache.len();
        let pruned = cache.set_head(&[30u8; 32]).expect("set head");
        assert!(pruned.is_empty());
        assert_eq!(cache.len(), before);
    }

    #[test]
    fn depth_bound_holds_for_all_stored_blocks() {
        let cache = chain_cache(1, 50, 7);
        let head_number = cache.head().expect("head").number;
        for entry in cache.blocks.values() {
            assert!(head_number - entry.block.number() <= cache.max_depth());
        }
    }

    #[test]
    fn ancestry_walks_to_deepest_stored_block() {
        let cache = chain_cache(5, 10, 10);
        let numbers: Vec<u64> = cache.ancestry(&[10u8; 32]).map(|b| b.number).collect();
        assert_eq!(numbers, vec![10, 9, 8, 7, 6, 5]);
    }

    #[test]
    fn find_ancestor_respects_min_height() {
        let cache = chain_cache(5, 10, 10);
        let found = cache.find_ancestor(&[10u8; 32], |b| b.number == 6, Some(6));
        assert_eq!(found.expect("found").number, 6);

        let not_found = cache.find_ancestor(&[10u8; 32], |b| b.number == 5, Some(6));
        assert!(not_found.is_none());
    }

    #[test]
    fn common_ancestor_across_fork() {
        let mut cache = chain_cache(1, 5, 10);
        // fork off block 3: 4' and 5'
        cache.add_block(stub(4, 104, 3));
        cache.add_block(stub(5, 105, 104));

        let ancestor = cache.common_ancestor(&[5u8; 32], &[105u8; 32]);
        assert_eq!(ancestor, Some([3u8; 32]));
        assert!(cache.is_ancestor(&[5u8; 32], &[3u8; 32]));
        assert!(!cache.is_ancestor(&[5u8; 32], &[104u8; 32]));
    }

    #[test]
    fn siblings_coexist_at_equal_height() {
        let mut cache = chain_cache(1, 5, 10);
        assert_eq!(cache.add_block(stub(5, 105, 4)), AddResult::Added);
        assert!(cache.has_block(&[5u8; 32], true));
        assert!(cache.has_block(&[105u8; 32], true));
        // head may sit at the same height as a sibling
        assert_eq!(cache.head().expect("head").number, 5);
    }

    mod confirmations {
        use super::*;
        use crate::types::{Block, Transaction};

        fn block_with_tx(number: u64, tag: u8, parent_tag: u8, tx_hash: Option<Hash256>) -> Block {
            let transactions = tx_hash
                .map(|hash| {
                    vec![Transaction {
                        hash,
                        from: [1u8; 20],
                        to: Some([2u8; 20]),
                        nonce: 0,
                        chain_id: 1,
                        data: vec![],
                        value: 0,
                        gas_limit: 21_000,
                        gas_price: 1,
                        block_number: number,
                    }]
                })
                .unwrap_or_default();
            Block {
                hash: [tag; 32],
                number,
                parent_hash: [parent_tag; 32],
                transactions,
                logs: vec![],
            }
        }

        #[test]
        fn confirmations_count_from_head_inclusive() {
            let mut cache = BlockCache::new(10).expect("valid depth");
            let tx = [0xEE; 32];
            cache.add_block(block_with_tx(1, 1, 0, None));
            cache.set_head(&[1u8; 32]).expect("head");
            cache.add_block(block_with_tx(2, 2, 1, Some(tx)));
            cache.set_head(&[2u8; 32]).expect("head");

            assert_eq!(cache.get_confirmations(&[2u8; 32], &tx), 1);

            cache.add_block(block_with_tx(3, 3, 2, None));
            cache.set_head(&[3u8; 32]).expect("head");
            assert_eq!(cache.get_confirmations(&[3u8; 32], &tx), 2);
        }

        #[test]
        fn confirmations_zero_when_off_branch() {
            let mut cache = BlockCache::new(10).expect("valid depth");
            let tx = [0xEE; 32];
            cache.add_block(block_with_tx(1, 1, 0, None));
            cache.set_head(&[1u8; 32]).expect("head");
            cache.add_block(block_with_tx(2, 2, 1, Some(tx)));
            // sibling branch without the tx
            cache.add_block(block_with_tx(2, 102, 1, None));

            assert_eq!(cache.get_confirmations(&[102u8; 32], &tx), 0);
        }

        #[test]
        fn confirmations_monotonic_along_one_branch() {
            let mut cache = BlockCache::new(20).expect("valid depth");
            let tx = [0xEE; 32];
            cache.add_block(block_with_tx(1, 1, 0, Some(tx)));
            cache.set_head(&[1u8; 32]).expect("head");

            let mut last = cache.get_confirmations(&[1u8; 32], &tx);
            for n in 2..=10u64 {
                cache.add_block(block_with_tx(n, n as u8, (n - 1) as u8, None));
                cache.set_head(&[n as u8; 32]).expect("head");
                let confs = cache.get_confirmations(&[n as u8; 32], &tx);
                assert!(confs >= last, "confirmations regressed at height {n}");
                last = confs;
            }
            assert_eq!(last, 10);
        }
    }
}
