use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHeaderKey {
    pub index_name: String,
    pub file_name: String,
}

impl FileHeaderKey {
    pub fn new(index_name: &str, file_name: &str) -> Self {
        Self {
            index_name: index_name.to_string(),
            file_name: file_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeaderValue {
    /// milliseconds since the unix epoch
    pub last_modified: u64,
    pub length: u64,
}

impl FileHeaderValue {
    pub fn new(last_modified: u64, length: u64) -> Self {
        Self {
            last_modified,
            length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileBucketKey {
    pub index_name: String,
    pub file_name: String,
    pub bucket_index: u64,
}

impl FileBucketKey {
    pub fn new(index_name: &str, file_name: &str, bucket_index: u64) -> Self {
        Self {
            index_name: index_name.to_string(),
            file_name: file_name.to_string(),
            bucket_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBucketValue(pub Vec<u8>);

impl FileBucketValue {
    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn into_data(self) -> Vec<u8> {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    Header(FileHeaderKey),
    Bucket(FileBucketKey),
}

impl CacheKey {
    pub fn header(index_name: &str, file_name: &str) -> Self {
        CacheKey::Header(FileHeaderKey::new(index_name, file_name))
    }

    pub fn bucket(index_name: &str, file_name: &str, bucket_index: u64) -> Self {
        CacheKey::Bucket(FileBucketKey::new(index_name, file_name, bucket_index))
    }

    pub fn index_name(&self) -> &str {
        match self {
            CacheKey::Header(key) => &key.index_name,
            CacheKey::Bucket(key) => &key.index_name,
        }
    }

    pub fn file_name(&self) -> &str {
        match self {
            CacheKey::Header(key) => &key.file_name,
            CacheKey::Bucket(key) => &key.file_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Header(FileHeaderValue),
    Bucket(FileBucketValue),
}

impl CacheValue {
    pub fn as_header(&self) -> Option<&FileHeaderValue> {
        match self {
            CacheValue::Header(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bucket(&self) -> Option<&FileBucketValue> {
        match self {
            CacheValue::Bucket(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_bucket(self) -> Option<FileBucketValue> {
        match self {
            CacheValue::Bucket(value) => Some(value),
            _ => None,
        }
    }

    /// true when this value may be stored under `key`
    pub fn matches_key(&self, key: &CacheKey) -> bool {
        matches!(
            (key, self),
            (CacheKey::Header(_), CacheValue::Header(_))
                | (CacheKey::Bucket(_), CacheValue::Bucket(_))
        )
    }
}

/// The full set of entries one file publishes on close.
pub type PublishBatch = HashMap<CacheKey, CacheValue>;
