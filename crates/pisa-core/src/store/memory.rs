//! In-memory store used by unit tests and ephemeral runs.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::{BatchOp, ItemStore, ItemStoreError, WriteBatch};

#[derive(Default)]
pub struct MemoryStore {
    items: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

fn physical_key(namespace: &str, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(namespace.len() + 1 + key.len());
    buf.extend_from_slice(namespace.as_bytes());
    buf.push(b':');
    buf.extend_from_slice(key);
    buf
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ItemStore for MemoryStore {
    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ItemStoreError> {
        Ok(self.items.read().get(&physical_key(namespace, key)).cloned())
    }

    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), ItemStoreError> {
        self.items.write().insert(physical_key(namespace, key), value.to_vec());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), ItemStoreError> {
        self.items.write().remove(&physical_key(namespace, key));
        Ok(())
    }

    fn scan_prefix(
        &self,
        namespace: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ItemStoreError> {
        let physical_prefix = physical_key(namespace, prefix);
        let strip = namespace.len() + 1;
        Ok(self
            .items
            .read()
            .range(physical_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&physical_prefix))
            .map(|(k, v)| (k[strip..].to_vec(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), ItemStoreError> {
        let mut items = self.items.write();
        for op in batch.ops() {
            match op {
                BatchOp::Put { namespace, key, value } => {
                    items.insert(physical_key(namespace, key), value.clone());
                }
                BatchOp::Delete { namespace, key } => {
                    items.remove(&physical_key(namespace, key));
                }
            }
        }
        Ok(())
    }
}
