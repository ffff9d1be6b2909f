//! Per-block derived-item persistence.
//!
//! Components persist values keyed by `(block hash, item name)` under their
//! own namespace (`block-cache:<component>`). The store also keeps the
//! block records themselves under the `blocks` component so the cache graph
//! can be restored after a restart. Deleting a block removes its items
//! across every registered component in one batch, which is how pruning
//! stays atomic with the block's disappearance.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::store::{batch_put_json, ItemStore, ItemStoreError, ItemStoreExt, WriteBatch};
use crate::types::Hash256;

/// Component name reserved for the block records themselves.
pub const BLOCKS_COMPONENT: &str = "blocks";

const ITEM_SEPARATOR: u8 = b'/';

fn namespace(component: &str) -> String {
    format!("block-cache:{component}")
}

fn item_key(hash: &Hash256, item: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(hash.len() + 1 + item.len());
    key.extend_from_slice(hash);
    key.push(ITEM_SEPARATOR);
    key.extend_from_slice(item.as_bytes());
    key
}

/// Block-hash-keyed view over the durable store.
pub struct BlockItemStore {
    store: Arc<dyn ItemStore>,
    components: RwLock<BTreeSet<String>>,
}

impl BlockItemStore {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        let mut components = BTreeSet::new();
        components.insert(BLOCKS_COMPONENT.to_string());
        Self { store, components: RwLock::new(components) }
    }

    /// Registers a component so its items participate in block deletion.
    pub fn register_component(&self, component: &str) {
        self.components.write().insert(component.to_string());
    }

    /// Reads a derived item for a block, `None` when absent.
    pub fn get_item<T: DeserializeOwned>(
        &self,
        component: &str,
        hash: &Hash256,
        item: &str,
    ) -> Result<Option<T>, ItemStoreError> {
        self.store.get_json(&namespace(component), &item_key(hash, item))
    }

    /// Buffers a derived item write for a block.
    pub fn put_item<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        component: &str,
        hash: &Hash256,
        item: &str,
        value: &T,
    ) {
        batch_put_json(batch, &namespace(component), &item_key(hash, item), value);
    }

    /// Buffers the block record itself for crash recovery.
    pub fn put_block_record<B: Serialize>(
        &self,
        batch: &mut WriteBatch,
        hash: &Hash256,
        block: &B,
    ) {
        self.put_item(batch, BLOCKS_COMPONENT, hash, "block", block);
    }

    /// All persisted block records, in unspecified order.
    pub fn load_block_records<B: DeserializeOwned>(&self) -> Result<Vec<B>, ItemStoreError> {
        let ns = namespace(BLOCKS_COMPONENT);
        let mut blocks = Vec::new();
        for (_, bytes) in self.store.scan_prefix(&ns, &[])? {
            let block = serde_json::from_slice(&bytes)
                .map_err(|source| ItemStoreError::Corrupt { namespace: ns.clone(), source })?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Buffers the deletion of every item of `hash` across all registered
    /// components, the block record included.
    pub fn delete_block(
        &self,
        batch: &mut WriteBatch,
        hash: &Hash256,
    ) -> Result<(), ItemStoreError> {
        let components = self.components.read().clone();
        for component in &components {
            let ns = namespace(component);
            for (key, _) in self.store.scan_prefix(&ns, hash)? {
                batch.delete(&ns, &key);
            }
        }
        Ok(())
    }

    /// Commits a buffered batch.
    pub fn commit(&self, batch: WriteBatch) -> Result<(), ItemStoreError> {
        self.store.commit(batch)
    }

    /// The underlying store, for namespaces that are not block-keyed.
    #[must_use]
    pub fn raw(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }
}
