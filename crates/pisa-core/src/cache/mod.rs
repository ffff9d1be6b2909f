//! Recent-chain state: the in-memory block DAG and its durable side-table.

mod block_cache;
mod item_store;

pub use block_cache::{AddResult, Ancestry, BlockCache, BlockCacheError};
pub use item_store::{BlockItemStore, BLOCKS_COMPONENT};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::BlockIdentity;

/// Shared handle to the cache: the processor takes short write locks to
/// mutate, every other component reads.
pub type SharedBlockCache<B> = Arc<RwLock<BlockCache<B>>>;

/// Wraps a cache for sharing.
pub fn shared<B: BlockIdentity>(cache: BlockCache<B>) -> SharedBlockCache<B> {
    Arc::new(RwLock::new(cache))
}
