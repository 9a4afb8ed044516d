use super::Backend;
use crate::error::{HullError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// In-process backend, mostly for tests and ephemeral daemons
#[derive(Default)]
pub struct MemoryBackend {
    buckets: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut buckets = self
            .buckets
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(buckets.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    fn list(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(buckets
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn remove(&self, bucket: &str, key: &str) -> Result<()> {
        let mut buckets = self
            .buckets
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;
        if let Some(b) = buckets.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }
}
