use std::sync::Arc;

use log::debug;

use crate::{BucketError, BucketResult, BucketStore, CacheKey, CacheValue};

/// Random-access reader over a file published by `BucketedOutput`.
///
/// A file only exists once its header is in the store. Buckets are fetched
/// one at a time as the read position reaches them.
pub struct BucketedInput {
    store: Arc<dyn BucketStore>,
    index_name: String,
    file_name: String,
    bucket_size: usize,
    length: u64,
    last_modified: u64,

    current_index: Option<u64>,
    current_bucket: Vec<u8>,
    position: u64,
}

impl BucketedInput {
    pub async fn open(
        store: Arc<dyn BucketStore>,
        index_name: &str,
        file_name: &str,
        bucket_size: usize,
    ) -> BucketResult<Self> {
        if bucket_size == 0 {
            return Err(BucketError::InvalidParam(
                "bucket size must be positive".to_string(),
            ));
        }

        let header = match store.get(&CacheKey::header(index_name, file_name)).await? {
            Some(CacheValue::Header(header)) => header,
            Some(_) => {
                return Err(BucketError::InvalidData(format!(
                    "header of {}/{} is not a header record",
                    index_name, file_name
                )))
            }
            None => {
                return Err(BucketError::NotFound(format!(
                    "{}/{}",
                    index_name, file_name
                )))
            }
        };

        Ok(Self {
            store,
            index_name: index_name.to_string(),
            file_name: file_name.to_string(),
            bucket_size,
            length: header.length,
            last_modified: header.last_modified,
            current_index: None,
            current_bucket: Vec::new(),
            position: 0,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    pub fn file_pointer(&self) -> u64 {
        self.position
    }

    pub fn seek(&mut self, pos: u64) -> BucketResult<()> {
        if pos > self.length {
            return Err(BucketError::OffsetTooLarge(format!(
                "seek to {} past end of {} ({})",
                pos, self.file_name, self.length
            )));
        }
        self.position = pos;
        Ok(())
    }

    pub async fn read_byte(&mut self) -> BucketResult<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf).await?;
        Ok(buf[0])
    }

    /// Fills `buf` completely or fails without moving the position.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> BucketResult<()> {
        let end = self.position + buf.len() as u64;
        if end > self.length {
            return Err(BucketError::OffsetTooLarge(format!(
                "read {} bytes at {} past end of {} ({})",
                buf.len(),
                self.position,
                self.file_name,
                self.length
            )));
        }

        let bucket_size = self.bucket_size as u64;
        let mut position = self.position;
        let mut filled = 0;
        while filled < buf.len() {
            self.load_bucket(position / bucket_size).await?;
            let offset = (position % bucket_size) as usize;
            let to_copy = (self.current_bucket.len() - offset).min(buf.len() - filled);
            buf[filled..filled + to_copy]
                .copy_from_slice(&self.current_bucket[offset..offset + to_copy]);
            filled += to_copy;
            position += to_copy as u64;
        }

        self.position = position;
        Ok(())
    }

    async fn load_bucket(&mut self, index: u64) -> BucketResult<()> {
        if self.current_index == Some(index) {
            return Ok(());
        }

        let key = CacheKey::bucket(&self.index_name, &self.file_name, index);
        let data = match self.store.get(&key).await? {
            Some(CacheValue::Bucket(value)) => value.into_data(),
            _ => {
                return Err(BucketError::InvalidData(format!(
                    "bucket #{} of {}/{} is missing",
                    index, self.index_name, self.file_name
                )))
            }
        };

        let bucket_size = self.bucket_size as u64;
        let expected = bucket_size.min(self.length - index * bucket_size) as usize;
        if data.len() < expected {
            return Err(BucketError::InvalidData(format!(
                "bucket #{} of {}/{} has {} bytes, expected {}",
                index,
                self.index_name,
                self.file_name,
                data.len(),
                expected
            )));
        }

        debug!("BucketedInput: {} loaded bucket #{}", self.file_name, index);
        self.current_index = Some(index);
        self.current_bucket = data;
        Ok(())
    }
}
