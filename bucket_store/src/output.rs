use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::record::unix_timestamp_millis;
use crate::{
    BucketError, BucketResult, BucketStore, CacheKey, CacheValue, FileBucketValue,
    FileHeaderValue, PublishBatch,
};

/// Sequential writer with random seek, the way a search index writes its files.
#[async_trait]
pub trait IndexOutput: Send {
    fn write_byte(&mut self, b: u8) -> BucketResult<()>;
    fn write_bytes(&mut self, buf: &[u8]) -> BucketResult<()>;
    fn file_pointer(&self) -> u64;
    fn flush(&mut self) -> BucketResult<()>;
    fn seek(&mut self, pos: u64) -> BucketResult<()>;
    fn length(&self) -> u64;
    async fn close(&mut self) -> BucketResult<()>;
}

/// Index output that keeps the whole file in fixed-size buckets and only
/// publishes them to the store on close.
///
/// Nothing is visible in the store before `close`; seeking is allowed
/// anywhere at any time while the output is open. Bucket `i` covers bytes
/// `[i * bucket_size, (i + 1) * bucket_size)`.
pub struct BucketedOutput {
    store: Arc<dyn BucketStore>,
    index_name: String,
    file_name: String,
    bucket_size: usize,

    buckets: Vec<Vec<u8>>,
    // None until the first write or seek selects a bucket
    current_bucket: Option<usize>,
    bucket_position: usize,
    bucket_start: u64,
    bucket_length: usize,

    length: u64,
    open: bool,
}

impl BucketedOutput {
    pub fn new(
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

        Ok(Self {
            store,
            index_name: index_name.to_string(),
            file_name: file_name.to_string(),
            bucket_size,
            buckets: Vec::new(),
            current_bucket: None,
            bucket_position: 0,
            bucket_start: 0,
            bucket_length: 0,
            length: 0,
            open: true,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn write_byte(&mut self, b: u8) -> BucketResult<()> {
        self.ensure_open("write_byte")?;
        let index = self.writable_bucket();
        self.buckets[index][self.bucket_position] = b;
        self.bucket_position += 1;
        Ok(())
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> BucketResult<()> {
        self.ensure_open("write_bytes")?;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let index = self.writable_bucket();
            let to_copy = (self.bucket_length - self.bucket_position).min(remaining.len());
            let start = self.bucket_position;
            self.buckets[index][start..start + to_copy].copy_from_slice(&remaining[..to_copy]);
            self.bucket_position += to_copy;
            remaining = &remaining[to_copy..];
        }
        Ok(())
    }

    pub fn file_pointer(&self) -> u64 {
        match self.current_bucket {
            None => 0,
            Some(_) => self.bucket_start + self.bucket_position as u64,
        }
    }

    /// Only updates the logical length; data reaches the store on `close`.
    pub fn flush(&mut self) -> BucketResult<()> {
        self.ensure_open("flush")?;
        self.update_length();
        Ok(())
    }

    pub fn seek(&mut self, pos: u64) -> BucketResult<()> {
        self.ensure_open("seek")?;
        // keep the length of a forward write that was not flushed yet
        self.update_length();

        let bucket_size = self.bucket_size as u64;
        if pos < self.bucket_start || pos >= self.bucket_start + self.bucket_length as u64 {
            let index = usize::try_from(pos / bucket_size).map_err(|_| {
                BucketError::OffsetTooLarge(format!("seek to {} in {}", pos, self.file_name))
            })?;
            self.switch_bucket(index);
        }
        self.bucket_position = (pos % bucket_size) as usize;
        Ok(())
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Publishes every bucket plus the file header in one `put_all`.
    ///
    /// Closing twice is a no-op. The buckets are handed to the store and
    /// released whatever the outcome; retrying is up to the caller.
    pub async fn close(&mut self) -> BucketResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.update_length();

        let batch = self.take_batch(unix_timestamp_millis());
        let entry_count = batch.len();
        if let Err(e) = self.store.put_all(batch).await {
            warn!(
                "BucketedOutput: publish {}/{} failed: {}",
                self.index_name, self.file_name, e
            );
            return Err(BucketError::directory(
                &self.index_name,
                &self.file_name,
                "failed to flush buckets",
                e,
            ));
        }

        debug!(
            "BucketedOutput: published {}/{} length:{} entries:{}",
            self.index_name, self.file_name, self.length, entry_count
        );
        Ok(())
    }

    fn ensure_open(&self, op: &str) -> BucketResult<()> {
        if !self.open {
            return Err(BucketError::InvalidState(format!(
                "{} on closed output {}/{}",
                op, self.index_name, self.file_name
            )));
        }
        Ok(())
    }

    // bucket the next byte goes to, moving to the following bucket when the
    // current one is full (or none is selected yet)
    fn writable_bucket(&mut self) -> usize {
        match self.current_bucket {
            Some(index) if self.bucket_position < self.bucket_length => index,
            current => {
                let next = current.map_or(0, |index| index + 1);
                self.switch_bucket(next);
                next
            }
        }
    }

    fn switch_bucket(&mut self, index: usize) {
        let allocated = (index + 1).saturating_sub(self.buckets.len());
        while self.buckets.len() <= index {
            self.buckets.push(vec![0u8; self.bucket_size]);
        }
        if allocated > 1 {
            debug!(
                "BucketedOutput: {} allocated {} buckets up to #{}",
                self.file_name, allocated, index
            );
        }

        self.current_bucket = Some(index);
        self.bucket_position = 0;
        self.bucket_start = self.bucket_size as u64 * index as u64;
        self.bucket_length = self.buckets[index].len();
    }

    fn update_length(&mut self) {
        let pointer = self.bucket_start + self.bucket_position as u64;
        if pointer > self.length {
            self.length = pointer;
        }
    }

    // Moves the buckets out into the publish batch. Only the buckets that
    // hold file bytes are published, the last one trimmed to the length.
    fn take_batch(&mut self, last_modified: u64) -> PublishBatch {
        let bucket_size = self.bucket_size as u64;
        let published = self.length.div_ceil(bucket_size) as usize;

        let mut buckets = std::mem::take(&mut self.buckets);
        buckets.truncate(published);

        let mut batch = PublishBatch::with_capacity(published + 1);
        for (i, mut data) in buckets.into_iter().enumerate() {
            if i + 1 == published {
                data.truncate((self.length - bucket_size * i as u64) as usize);
            }
            batch.insert(
                CacheKey::bucket(&self.index_name, &self.file_name, i as u64),
                CacheValue::Bucket(FileBucketValue(data)),
            );
        }
        batch.insert(
            CacheKey::header(&self.index_name, &self.file_name),
            CacheValue::Header(FileHeaderValue::new(last_modified, self.length)),
        );
        batch
    }
}

#[async_trait]
impl IndexOutput for BucketedOutput {
    fn write_byte(&mut self, b: u8) -> BucketResult<()> {
        BucketedOutput::write_byte(self, b)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> BucketResult<()> {
        BucketedOutput::write_bytes(self, buf)
    }

    fn file_pointer(&self) -> u64 {
        BucketedOutput::file_pointer(self)
    }

    fn flush(&mut self) -> BucketResult<()> {
        BucketedOutput::flush(self)
    }

    fn seek(&mut self, pos: u64) -> BucketResult<()> {
        BucketedOutput::seek(self, pos)
    }

    fn length(&self) -> u64 {
        BucketedOutput::length(self)
    }

    async fn close(&mut self) -> BucketResult<()> {
        BucketedOutput::close(self).await
    }
}

impl std::io::Write for BucketedOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        BucketedOutput::write_bytes(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        BucketedOutput::flush(self)?;
        Ok(())
    }
}

impl std::io::Seek for BucketedOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.file_pointer().checked_add_signed(delta),
            SeekFrom::End(delta) => {
                BucketedOutput::flush(self)?;
                self.length.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid seek {:?} in {}", pos, self.file_name),
            )
        })?;

        BucketedOutput::seek(self, target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBucketStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const INDEX: &str = "test-index";

    struct CountingStore {
        inner: MemoryBucketStore,
        put_all_calls: AtomicUsize,
    }

    #[async_trait]
    impl BucketStore for CountingStore {
        async fn get(&self, key: &CacheKey) -> BucketResult<Option<CacheValue>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: CacheKey, value: CacheValue) -> BucketResult<()> {
            self.inner.put(key, value).await
        }

        async fn put_all(&self, entries: PublishBatch) -> BucketResult<()> {
            self.put_all_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.put_all(entries).await
        }

        async fn remove(&self, key: &CacheKey) -> BucketResult<()> {
            self.inner.remove(key).await
        }
    }

    struct FailingStore;

    #[async_trait]
    impl BucketStore for FailingStore {
        async fn get(&self, _key: &CacheKey) -> BucketResult<Option<CacheValue>> {
            Ok(None)
        }

        async fn put(&self, _key: CacheKey, _value: CacheValue) -> BucketResult<()> {
            Err(BucketError::IoError("connection reset".to_string()))
        }

        async fn put_all(&self, _entries: PublishBatch) -> BucketResult<()> {
            Err(BucketError::IoError("connection reset".to_string()))
        }

        async fn remove(&self, _key: &CacheKey) -> BucketResult<()> {
            Ok(())
        }
    }

    fn new_output(store: &Arc<MemoryBucketStore>, file_name: &str, bucket_size: usize) -> BucketedOutput {
        BucketedOutput::new(store.clone(), INDEX, file_name, bucket_size).unwrap()
    }

    async fn published_header(store: &MemoryBucketStore, file_name: &str) -> FileHeaderValue {
        let value = store
            .get(&CacheKey::header(INDEX, file_name))
            .await
            .unwrap()
            .expect("header published");
        *value.as_header().unwrap()
    }

    async fn published_buckets(store: &MemoryBucketStore, file_name: &str) -> Vec<Vec<u8>> {
        let mut buckets = Vec::new();
        loop {
            let key = CacheKey::bucket(INDEX, file_name, buckets.len() as u64);
            match store.get(&key).await.unwrap() {
                Some(value) => buckets.push(value.into_bucket().unwrap().into_data()),
                None => break,
            }
        }
        buckets
    }

    #[tokio::test]
    async fn test_write_then_close_publishes_trimmed_buckets() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "_0.fdt", 4);

        output.write_bytes(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        assert_eq!(output.file_pointer(), 7);
        assert!(store.is_empty());
        output.close().await.unwrap();

        assert_eq!(
            published_buckets(&store, "_0.fdt").await,
            vec![vec![1, 2, 3, 4], vec![5, 6, 7]]
        );
        assert_eq!(published_header(&store, "_0.fdt").await.length, 7);
    }

    #[tokio::test]
    async fn test_seek_back_and_overwrite() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "_0.fdx", 4);

        output.write_bytes(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        output.seek(2).unwrap();
        assert_eq!(output.file_pointer(), 2);
        output.write_bytes(&[9, 9]).unwrap();
        assert_eq!(output.length(), 7);
        output.close().await.unwrap();

        assert_eq!(
            published_buckets(&store, "_0.fdx").await,
            vec![vec![1, 2, 9, 9], vec![5, 6, 7]]
        );
        assert_eq!(published_header(&store, "_0.fdx").await.length, 7);
    }

    #[tokio::test]
    async fn test_empty_file_publishes_only_header() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "empty", 8);
        assert_eq!(output.file_pointer(), 0);
        output.close().await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(published_header(&store, "empty").await.length, 0);
    }

    #[tokio::test]
    async fn test_exact_bucket_multiple() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "exact", 4);
        output.write_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        // lands on the boundary and selects a fresh bucket
        output.seek(8).unwrap();
        output.close().await.unwrap();

        let buckets = published_buckets(&store, "exact").await;
        assert_eq!(buckets, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(published_header(&store, "exact").await.length, 8);
    }

    #[tokio::test]
    async fn test_round_trip_many_bucket_sizes() {
        let data: Vec<u8> = (0..100u32).map(|i| (i * 7 % 251) as u8).collect();
        for bucket_size in [1usize, 3, 4, 7, 64, 100, 128] {
            let store = Arc::new(MemoryBucketStore::new());
            let file_name = format!("f{}", bucket_size);
            let mut output = new_output(&store, &file_name, bucket_size);
            output.write_byte(data[0]).unwrap();
            output.write_bytes(&data[1..]).unwrap();
            output.close().await.unwrap();

            let buckets = published_buckets(&store, &file_name).await;
            assert_eq!(buckets.len(), data.len().div_ceil(bucket_size));
            for bucket in &buckets[..buckets.len() - 1] {
                assert_eq!(bucket.len(), bucket_size);
            }
            let last_len = data.len() - bucket_size * ((data.len() - 1) / bucket_size);
            assert_eq!(buckets.last().unwrap().len(), last_len);
            assert_eq!(buckets.concat(), data);
        }
    }

    #[tokio::test]
    async fn test_forward_seek_fills_gap_with_zero_buckets() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "gap", 4);
        output.write_byte(1).unwrap();
        output.seek(10).unwrap();
        assert_eq!(output.file_pointer(), 10);
        assert_eq!(output.buckets.len(), 3);
        output.write_byte(7).unwrap();
        output.close().await.unwrap();

        assert_eq!(
            published_buckets(&store, "gap").await,
            vec![vec![1, 0, 0, 0], vec![0, 0, 0, 0], vec![0, 0, 7]]
        );
        assert_eq!(published_header(&store, "gap").await.length, 11);
    }

    #[tokio::test]
    async fn test_seek_sets_pointer() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "ptr", 5);
        output.write_bytes(&[0; 12]).unwrap();
        for pos in [0u64, 4, 5, 11, 12, 3, 40, 0] {
            output.seek(pos).unwrap();
            assert_eq!(output.file_pointer(), pos);
        }
    }

    #[tokio::test]
    async fn test_backward_seek_keeps_tail_and_length() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "tail", 3);
        let data: Vec<u8> = (1..=10).collect();
        output.write_bytes(&data).unwrap();

        let mut last_length = output.length();
        output.seek(2).unwrap();
        assert!(output.length() >= last_length);
        last_length = output.length();
        assert_eq!(last_length, 10);

        output.write_bytes(&[0xAA, 0xBB, 0xCC]).unwrap();
        output.flush().unwrap();
        assert!(output.length() >= last_length);
        output.seek(1).unwrap();
        assert_eq!(output.length(), 10);
        output.close().await.unwrap();

        let buckets = published_buckets(&store, "tail").await;
        assert_eq!(
            buckets.concat(),
            vec![1, 2, 0xAA, 0xBB, 0xCC, 6, 7, 8, 9, 10]
        );
    }

    #[tokio::test]
    async fn test_length_is_updated_lazily() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "lazy", 4);
        output.write_bytes(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(output.length(), 0);
        output.flush().unwrap();
        assert_eq!(output.length(), 5);
    }

    #[tokio::test]
    async fn test_close_twice_publishes_once() {
        let store = Arc::new(CountingStore {
            inner: MemoryBucketStore::new(),
            put_all_calls: AtomicUsize::new(0),
        });
        let mut output = BucketedOutput::new(store.clone(), INDEX, "twice", 4).unwrap();
        output.write_bytes(&[1, 2, 3]).unwrap();

        output.close().await.unwrap();
        output.close().await.unwrap();
        assert_eq!(store.put_all_calls.load(Ordering::SeqCst), 1);
        assert!(!output.is_open());
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "closed", 4);
        output.write_bytes(&[1, 2, 3]).unwrap();
        output.close().await.unwrap();

        assert!(matches!(output.write_byte(1), Err(BucketError::InvalidState(_))));
        assert!(matches!(output.write_bytes(&[1]), Err(BucketError::InvalidState(_))));
        assert!(matches!(output.seek(0), Err(BucketError::InvalidState(_))));
        assert!(matches!(output.flush(), Err(BucketError::InvalidState(_))));
        assert_eq!(output.length(), 3);
        assert_eq!(output.file_pointer(), 3);
    }

    #[tokio::test]
    async fn test_store_failure_is_wrapped() {
        let mut output = BucketedOutput::new(Arc::new(FailingStore), INDEX, "_1.cfs", 4).unwrap();
        output.write_bytes(&[1; 9]).unwrap();

        let err = output.close().await.unwrap_err();
        match err {
            BucketError::Directory {
                index_name,
                file_name,
                message,
                source,
            } => {
                assert_eq!(index_name, INDEX);
                assert_eq!(file_name, "_1.cfs");
                assert_eq!(message, "failed to flush buckets");
                assert!(matches!(*source, BucketError::IoError(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(output.buckets.is_empty());

        // no retry on a second close
        output.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_bucket_size_rejected() {
        let store: Arc<dyn BucketStore> = Arc::new(MemoryBucketStore::new());
        assert!(matches!(
            BucketedOutput::new(store, INDEX, "f", 0),
            Err(BucketError::InvalidParam(_))
        ));
    }

    #[tokio::test]
    async fn test_io_write_and_seek() {
        use std::io::{Seek, Write};

        let store = Arc::new(MemoryBucketStore::new());
        let mut output = new_output(&store, "io", 4);
        output.write_all(b"hello world").unwrap();

        let pos = Seek::seek(&mut output, SeekFrom::End(-5)).unwrap();
        assert_eq!(pos, 6);
        output.write_all(b"W").unwrap();
        let pos = Seek::seek(&mut output, SeekFrom::Current(-7)).unwrap();
        assert_eq!(pos, 0);
        output.write_all(b"H").unwrap();
        assert!(Seek::seek(&mut output, SeekFrom::Current(-2)).is_err());

        Write::flush(&mut output).unwrap();
        output.close().await.unwrap();
        assert_eq!(published_buckets(&store, "io").await.concat(), b"Hello World");
    }

    #[tokio::test]
    async fn test_through_trait_object() {
        let store = Arc::new(MemoryBucketStore::new());
        let mut output: Box<dyn IndexOutput> = Box::new(new_output(&store, "dyn", 2));
        output.write_bytes(&[5, 6, 7]).unwrap();
        output.seek(0).unwrap();
        output.write_byte(4).unwrap();
        assert_eq!(output.length(), 3);
        output.close().await.unwrap();

        assert_eq!(
            published_buckets(&store, "dyn").await,
            vec![vec![4, 6], vec![7]]
        );
    }
}
