//! Namespaced durable key/value storage.
//!
//! Every persisted artifact of the watchtower (block records, anchor
//! states, the head pointer, the responder journal, the appointment
//! registry) goes through [`ItemStore`]. Writes can be buffered in a
//! [`WriteBatch`] and committed atomically across every namespace touched,
//! which is how derived items are dropped together with their block during
//! pruning.
//!
//! A read that finds nothing is `Ok(None)`, never an error; only backend
//! failures surface as [`ItemStoreError`].

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use thiserror::Error;

/// Errors from the storage backend.
#[derive(Debug, Error)]
pub enum ItemStoreError {
    /// A key that a caller required to exist was absent.
    #[error("item not found: {namespace}:{key}")]
    NotFound { namespace: String, key: String },

    /// Stored bytes failed to deserialize.
    #[error("corrupt item in {namespace}: {source}")]
    Corrupt {
        namespace: String,
        #[source]
        source: serde_json::Error,
    },

    /// Underlying storage failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<sled::Error> for ItemStoreError {
    fn from(err: sled::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// A single buffered write.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { namespace: String, key: Vec<u8>, value: Vec<u8> },
    Delete { namespace: String, key: Vec<u8> },
}

/// Buffered writes committed atomically via [`ItemStore::commit`].
///
/// A batch is plain data: it holds no backend resources and dropping it
/// discards the buffered writes.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, namespace: &str, key: &[u8], value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            namespace: namespace.to_string(),
            key: key.to_vec(),
            value,
        });
    }

    pub fn delete(&mut self, namespace: &str, key: &[u8]) {
        self.ops
            .push(BatchOp::Delete { namespace: namespace.to_string(), key: key.to_vec() });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Namespaced key/value store with atomic batches.
///
/// Namespaces must not contain `:`; backends use it as the prefix
/// separator in their physical key layout.
pub trait ItemStore: Send + Sync + 'static {
    /// Reads the last committed value, `None` when absent.
    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ItemStoreError>;

    /// Writes a single value outside any batch.
    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), ItemStoreError>;

    /// Deletes a single key outside any batch. Deleting an absent key is a
    /// no-op.
    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), ItemStoreError>;

    /// All `(key, value)` pairs in a namespace whose key starts with
    /// `prefix`, in ascending key order.
    fn scan_prefix(
        &self,
        namespace: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ItemStoreError>;

    /// Commits a batch atomically across all namespaces it touches.
    fn commit(&self, batch: WriteBatch) -> Result<(), ItemStoreError>;
}

/// Extension helpers shared by every backend.
pub trait ItemStoreExt: ItemStore {
    /// Reads and deserializes, `None` when absent.
    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        namespace: &str,
        key: &[u8],
    ) -> Result<Option<T>, ItemStoreError> {
        match self.get(namespace, key)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| ItemStoreError::Corrupt { namespace: namespace.to_string(), source }),
        }
    }

    /// Reads a value that must exist.
    fn get_required(&self, namespace: &str, key: &[u8]) -> Result<Vec<u8>, ItemStoreError> {
        self.get(namespace, key)?.ok_or_else(|| ItemStoreError::NotFound {
            namespace: namespace.to_string(),
            key: format!("{key:02x?}"),
        })
    }
}

impl<S: ItemStore + ?Sized> ItemStoreExt for S {}

/// Serializes a value into a batch put.
pub fn batch_put_json<T: serde::Serialize>(
    batch: &mut WriteBatch,
    namespace: &str,
    key: &[u8],
    value: &T,
) {
    // serde_json cannot fail on the plain-data types persisted here
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    batch.put(namespace, key, bytes);
}
