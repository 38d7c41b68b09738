use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use log::debug;

use crate::{BucketError, BucketResult, CacheKey, CacheValue, PublishBatch};

/// Key/value cache that holds file headers and buckets.
///
/// `put_all` is expected to make the whole batch visible at once. A store
/// that can only apply entries one by one may leave a file partially
/// visible when it fails mid-batch; readers only trust a file whose header
/// is present.
#[async_trait]
pub trait BucketStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> BucketResult<Option<CacheValue>>;
    async fn put(&self, key: CacheKey, value: CacheValue) -> BucketResult<()>;
    async fn put_all(&self, entries: PublishBatch) -> BucketResult<()>;
    async fn remove(&self, key: &CacheKey) -> BucketResult<()>;
}

pub(crate) fn check_entry(key: &CacheKey, value: &CacheValue) -> BucketResult<()> {
    if !value.matches_key(key) {
        return Err(BucketError::InvalidParam(format!(
            "value kind does not match key {:?}",
            key
        )));
    }
    Ok(())
}

/// In-process store, mostly for tests and single-node setups.
pub struct MemoryBucketStore {
    entries: RwLock<HashMap<CacheKey, CacheValue>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn get(&self, key: &CacheKey) -> BucketResult<Option<CacheValue>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| BucketError::InvalidState("memory store poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> BucketResult<()> {
        check_entry(&key, &value)?;
        let mut entries = self
            .entries
            .write()
            .map_err(|_| BucketError::InvalidState("memory store poisoned".to_string()))?;
        entries.insert(key, value);
        Ok(())
    }

    async fn put_all(&self, batch: PublishBatch) -> BucketResult<()> {
        for (key, value) in batch.iter() {
            check_entry(key, value)?;
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| BucketError::InvalidState("memory store poisoned".to_string()))?;
        debug!("MemoryBucketStore: put_all {} entries", batch.len());
        entries.extend(batch);
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> BucketResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| BucketError::InvalidState("memory store poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}
