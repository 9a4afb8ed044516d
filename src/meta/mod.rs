//! Metadata store
//!
//! Durable key/value persistence for container records. Objects are
//! JSON-encoded and grouped into buckets; the byte-level storage is a
//! pluggable [`Backend`].

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;

use crate::error::{HullError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Bucket holding container records
pub const CONTAINER_BUCKET: &str = "containers";
/// Bucket holding CRI sandbox records
pub const SANDBOX_BUCKET: &str = "sandboxes";

/// A record persisted in the metadata store
pub trait Object: Serialize + DeserializeOwned {
    /// Bucket the record lives in
    const BUCKET: &'static str;

    /// Key of the record inside its bucket
    fn key(&self) -> String;
}

/// Byte-level storage backend
pub trait Backend: Send + Sync {
    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Returns `None` when the key does not exist
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// All `(key, value)` pairs of a bucket, sorted by key
    fn list(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Removing a missing key is not an error
    fn remove(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Typed metadata store over a backend
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Store backed by in-process memory
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn put<T: Object>(&self, obj: &T) -> Result<()> {
        let data = serde_json::to_vec(obj)?;
        self.backend.put(T::BUCKET, &obj.key(), &data)
    }

    pub fn get<T: Object>(&self, key: &str) -> Result<T> {
        match self.backend.get(T::BUCKET, key)? {
            Some(data) => Ok(serde_json::from_slice(&data)?),
            None => Err(HullError::NotFound {
                kind: "metadata",
                id: key.to_string(),
            }),
        }
    }

    pub fn exists<T: Object>(&self, key: &str) -> Result<bool> {
        Ok(self.backend.get(T::BUCKET, key)?.is_some())
    }

    pub fn get_with_prefix<T: Object>(&self, prefix: &str) -> Result<Vec<T>> {
        self.backend
            .list(T::BUCKET)?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(_, data)| serde_json::from_slice(&data).map_err(HullError::from))
            .collect()
    }

    pub fn list<T: Object>(&self) -> Result<Vec<T>> {
        self.get_with_prefix("")
    }

    pub fn remove<T: Object>(&self, key: &str) -> Result<()> {
        self.backend.remove(T::BUCKET, key)
    }

    /// Visit every record of a bucket. Stops at the first visitor error.
    pub fn for_each<T: Object>(&self, mut visitor: impl FnMut(T) -> Result<()>) -> Result<()> {
        for (_, data) in self.backend.list(T::BUCKET)? {
            visitor(serde_json::from_slice(&data)?)?;
        }
        Ok(())
    }
}
