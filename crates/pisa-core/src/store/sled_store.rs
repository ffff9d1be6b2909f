//! Sled-backed store.
//!
//! A single sled tree holds every namespace; physical keys are
//! `<namespace>:<key>`. Keeping all namespaces in one tree lets a single
//! `sled::Batch` commit atomically across namespaces, which the pruning
//! path relies on.

use std::path::Path;

use super::{BatchOp, ItemStore, ItemStoreError, WriteBatch};

pub struct SledStore {
    db: sled::Db,
}

fn physical_key(namespace: &str, key: &[u8]) -> Vec<u8> {
    debug_assert!(!namespace.contains(':'), "namespace must not contain ':'");
    let mut buf = Vec::with_capacity(namespace.len() + 1 + key.len());
    buf.extend_from_slice(namespace.as_bytes());
    buf.push(b':');
    buf.extend_from_slice(key);
    buf
}

impl SledStore {
    /// Opens (or creates) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ItemStoreError> {
        let db = sled::open(path.as_ref())?;
        Ok(Self { db })
    }

    /// Forces all dirty pages to disk.
    pub fn flush(&self) -> Result<(), ItemStoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl ItemStore for SledStore {
    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ItemStoreError> {
        Ok(self.db.get(physical_key(namespace, key))?.map(|v| v.to_vec()))
    }

    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), ItemStoreError> {
        self.db.insert(physical_key(namespace, key), value)?;
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), ItemStoreError> {
        self.db.remove(physical_key(namespace, key))?;
        Ok(())
    }

    fn scan_prefix(
        &self,
        namespace: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ItemStoreError> {
        let physical_prefix = physical_key(namespace, prefix);
        let strip = namespace.len() + 1;
        let mut items = Vec::new();
        for entry in self.db.scan_prefix(&physical_prefix) {
            let (k, v) = entry?;
            items.push((k[strip..].to_vec(), v.to_vec()));
        }
        Ok(items)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), ItemStoreError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops() {
            match op {
                BatchOp::Put { namespace, key, value } => {
                    sled_batch.insert(physical_key(namespace, key), value.clone());
                }
                BatchOp::Delete { namespace, key } => {
                    sled_batch.remove(physical_key(namespace, key));
                }
            }
        }
        self.db.apply_batch(sled_batch)?;
        self.db.flush()?;
        Ok(())
    }
}
