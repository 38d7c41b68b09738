use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    BucketError, BucketResult, BucketStore, BucketedInput, BucketedOutput, CacheKey, CacheValue,
    FileHeaderValue,
};

pub const DEFAULT_BUCKET_SIZE: usize = 8192;
pub const DEFAULT_INDEX_NAME: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketDirectoryConfig {
    pub index_name: String,
    pub bucket_size: usize,
}

impl Default for BucketDirectoryConfig {
    fn default() -> Self {
        Self {
            index_name: DEFAULT_INDEX_NAME.to_string(),
            bucket_size: DEFAULT_BUCKET_SIZE,
        }
    }
}

impl BucketDirectoryConfig {
    pub fn new(index_name: &str, bucket_size: usize) -> Self {
        Self {
            index_name: index_name.to_string(),
            bucket_size,
        }
    }

    pub async fn load(config_path: &Path) -> BucketResult<Self> {
        let config_str = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            warn!(
                "BucketDirectoryConfig: read {} failed! {}",
                config_path.display(),
                e
            );
            BucketError::NotFound(format!("config {} not found", config_path.display()))
        })?;
        let config = serde_json::from_str::<BucketDirectoryConfig>(&config_str).map_err(|e| {
            warn!("BucketDirectoryConfig: parse config failed! {}", e);
            BucketError::InvalidData(format!("invalid bucket directory config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BucketResult<()> {
        if self.bucket_size == 0 {
            return Err(BucketError::InvalidParam(
                "bucket_size must be positive".to_string(),
            ));
        }
        if self.index_name.is_empty() {
            return Err(BucketError::InvalidParam(
                "index_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Files of one index kept as header + bucket records in a `BucketStore`.
pub struct BucketDirectory {
    config: BucketDirectoryConfig,
    store: Arc<dyn BucketStore>,
}

impl BucketDirectory {
    pub fn new(config: BucketDirectoryConfig, store: Arc<dyn BucketStore>) -> BucketResult<Self> {
        config.validate()?;
        info!(
            "BucketDirectory: index {} bucket_size {}",
            config.index_name, config.bucket_size
        );
        Ok(Self { config, store })
    }

    pub fn index_name(&self) -> &str {
        &self.config.index_name
    }

    pub fn bucket_size(&self) -> usize {
        self.config.bucket_size
    }

    pub fn store(&self) -> Arc<dyn BucketStore> {
        self.store.clone()
    }

    pub fn create_output(&self, file_name: &str) -> BucketResult<BucketedOutput> {
        BucketedOutput::new(
            self.store.clone(),
            &self.config.index_name,
            file_name,
            self.config.bucket_size,
        )
    }

    pub async fn open_input(&self, file_name: &str) -> BucketResult<BucketedInput> {
        BucketedInput::open(
            self.store.clone(),
            &self.config.index_name,
            file_name,
            self.config.bucket_size,
        )
        .await
    }

    async fn get_header(&self, file_name: &str) -> BucketResult<Option<FileHeaderValue>> {
        let key = CacheKey::header(&self.config.index_name, file_name);
        match self.store.get(&key).await? {
            Some(CacheValue::Header(header)) => Ok(Some(header)),
            Some(_) => Err(BucketError::InvalidData(format!(
                "header of {} is not a header record",
                file_name
            ))),
            None => Ok(None),
        }
    }

    async fn require_header(&self, file_name: &str) -> BucketResult<FileHeaderValue> {
        self.get_header(file_name).await?.ok_or_else(|| {
            BucketError::NotFound(format!("{}/{}", self.config.index_name, file_name))
        })
    }

    pub async fn file_exists(&self, file_name: &str) -> BucketResult<bool> {
        Ok(self.get_header(file_name).await?.is_some())
    }

    pub async fn file_length(&self, file_name: &str) -> BucketResult<u64> {
        Ok(self.require_header(file_name).await?.length)
    }

    pub async fn file_modified(&self, file_name: &str) -> BucketResult<u64> {
        Ok(self.require_header(file_name).await?.last_modified)
    }

    /// Removes the header first so readers stop seeing the file, then its buckets.
    pub async fn delete_file(&self, file_name: &str) -> BucketResult<()> {
        let header = match self.get_header(file_name).await? {
            Some(header) => header,
            None => return Ok(()),
        };

        let index_name = &self.config.index_name;
        self.store
            .remove(&CacheKey::header(index_name, file_name))
            .await
            .map_err(|e| BucketError::directory(index_name, file_name, "failed to delete header", e))?;

        let bucket_count = header.length.div_ceil(self.config.bucket_size as u64);
        for bucket_index in 0..bucket_count {
            self.store
                .remove(&CacheKey::bucket(index_name, file_name, bucket_index))
                .await
                .map_err(|e| {
                    BucketError::directory(index_name, file_name, "failed to delete bucket", e)
                })?;
        }
        debug!(
            "BucketDirectory: deleted {}/{} ({} buckets)",
            index_name, file_name, bucket_count
        );
        Ok(())
    }
}
