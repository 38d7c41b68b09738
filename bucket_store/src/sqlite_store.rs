use async_trait::async_trait;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::store::check_entry;
use crate::{
    BucketError, BucketResult, BucketStore, CacheKey, CacheValue, FileBucketValue,
    FileHeaderValue, PublishBatch,
};

/// Bucket store kept in a local sqlite file.
///
/// Every `put_all` runs inside one transaction, so a file's buckets and
/// header become visible together or not at all.
pub struct SqliteBucketStore {
    conn: Mutex<Connection>,
}

impl SqliteBucketStore {
    pub fn new(db_path: PathBuf) -> BucketResult<Self> {
        let conn = Connection::open(&db_path)
            .map_err(|e| BucketError::DbError(format!("open db failed: {}", e)))?;
        Self::init(conn)
    }

    pub fn new_in_memory() -> BucketResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BucketError::DbError(format!("open db failed: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> BucketResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_headers (
                index_name TEXT NOT NULL,
                file_name TEXT NOT NULL,
                last_modified INTEGER NOT NULL,
                length INTEGER NOT NULL,
                PRIMARY KEY (index_name, file_name)
            )",
            [],
        )
        .map_err(|e| BucketError::DbError(format!("create table failed: {}", e)))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_buckets (
                index_name TEXT NOT NULL,
                file_name TEXT NOT NULL,
                bucket_index INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (index_name, file_name, bucket_index)
            )",
            [],
        )
        .map_err(|e| BucketError::DbError(format!("create table failed: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> BucketResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BucketError::InvalidState("sqlite connection poisoned".to_string()))
    }

    fn write_entry(conn: &Connection, key: &CacheKey, value: &CacheValue) -> BucketResult<()> {
        match (key, value) {
            (CacheKey::Header(key), CacheValue::Header(value)) => {
                conn.execute(
                    "INSERT OR REPLACE INTO file_headers (index_name, file_name, last_modified, length)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        key.index_name,
                        key.file_name,
                        value.last_modified as i64,
                        value.length as i64
                    ],
                )
                .map_err(|e| BucketError::DbError(format!("insert header failed: {}", e)))?;
            }
            (CacheKey::Bucket(key), CacheValue::Bucket(value)) => {
                conn.execute(
                    "INSERT OR REPLACE INTO file_buckets (index_name, file_name, bucket_index, payload)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        key.index_name,
                        key.file_name,
                        key.bucket_index as i64,
                        value.data()
                    ],
                )
                .map_err(|e| BucketError::DbError(format!("insert bucket failed: {}", e)))?;
            }
            _ => check_entry(key, value)?,
        }
        Ok(())
    }

    fn write_batch(tx: &Transaction<'_>, batch: &PublishBatch) -> BucketResult<()> {
        for (key, value) in batch.iter() {
            Self::write_entry(tx, key, value)?;
        }
        Ok(())
    }
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    async fn get(&self, key: &CacheKey) -> BucketResult<Option<CacheValue>> {
        let conn = self.lock_conn()?;
        match key {
            CacheKey::Header(key) => {
                let row = conn
                    .query_row(
                        "SELECT last_modified, length FROM file_headers
                         WHERE index_name = ?1 AND file_name = ?2",
                        params![key.index_name, key.file_name],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()
                    .map_err(|e| BucketError::DbError(format!("query header failed: {}", e)))?;
                Ok(row.map(|(last_modified, length)| {
                    CacheValue::Header(FileHeaderValue::new(last_modified as u64, length as u64))
                }))
            }
            CacheKey::Bucket(key) => {
                let row = conn
                    .query_row(
                        "SELECT payload FROM file_buckets
                         WHERE index_name = ?1 AND file_name = ?2 AND bucket_index = ?3",
                        params![key.index_name, key.file_name, key.bucket_index as i64],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()
                    .map_err(|e| BucketError::DbError(format!("query bucket failed: {}", e)))?;
                Ok(row.map(|payload| CacheValue::Bucket(FileBucketValue(payload))))
            }
        }
    }

    async fn put(&self, key: CacheKey, value: CacheValue) -> BucketResult<()> {
        check_entry(&key, &value)?;
        let conn = self.lock_conn()?;
        Self::write_entry(&conn, &key, &value)
    }

    async fn put_all(&self, batch: PublishBatch) -> BucketResult<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| BucketError::DbError(format!("begin transaction failed: {}", e)))?;

        // dropping `tx` on error rolls the whole batch back
        if let Err(e) = Self::write_batch(&tx, &batch) {
            warn!("SqliteBucketStore: put_all rolled back: {}", e);
            return Err(e);
        }

        tx.commit()
            .map_err(|e| BucketError::DbError(format!("commit failed: {}", e)))?;
        debug!("SqliteBucketStore: committed {} entries", batch.len());
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> BucketResult<()> {
        let conn = self.lock_conn()?;
        let deleted = match key {
            CacheKey::Header(key) => conn.execute(
                "DELETE FROM file_headers WHERE index_name = ?1 AND file_name = ?2",
                params![key.index_name, key.file_name],
            ),
            CacheKey::Bucket(key) => conn.execute(
                "DELETE FROM file_buckets
                 WHERE index_name = ?1 AND file_name = ?2 AND bucket_index = ?3",
                params![key.index_name, key.file_name, key.bucket_index as i64],
            ),
        };
        deleted.map_err(|e| BucketError::DbError(format!("delete failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_all_and_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("buckets.db");

        {
            let store = SqliteBucketStore::new(db_path.clone()).unwrap();
            let mut batch = PublishBatch::new();
            batch.insert(
                CacheKey::bucket("idx", "_0.tis", 0),
                CacheValue::Bucket(FileBucketValue(vec![1, 2, 3, 4])),
            );
            batch.insert(
                CacheKey::bucket("idx", "_0.tis", 1),
                CacheValue::Bucket(FileBucketValue(vec![5])),
            );
            batch.insert(
                CacheKey::header("idx", "_0.tis"),
                CacheValue::Header(FileHeaderValue::new(1000, 5)),
            );
            store.put_all(batch).await.unwrap();
        }

        let store = SqliteBucketStore::new(db_path).unwrap();
        let header = store
            .get(&CacheKey::header("idx", "_0.tis"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(header, CacheValue::Header(FileHeaderValue::new(1000, 5)));

        let last = store
            .get(&CacheKey::bucket("idx", "_0.tis", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.as_bucket().unwrap().data(), &[5]);
        assert!(store
            .get(&CacheKey::bucket("idx", "_0.tis", 2))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_put_all_rolls_back_on_bad_entry() {
        let store = SqliteBucketStore::new_in_memory().unwrap();
        let mut batch = PublishBatch::new();
        batch.insert(
            CacheKey::bucket("idx", "f", 0),
            CacheValue::Bucket(FileBucketValue(vec![9; 8])),
        );
        batch.insert(
            CacheKey::header("idx", "f"),
            CacheValue::Bucket(FileBucketValue(vec![0])),
        );

        let result = store.put_all(batch).await;
        assert!(matches!(result, Err(BucketError::InvalidParam(_))));
        assert!(store
            .get(&CacheKey::bucket("idx", "f", 0))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = SqliteBucketStore::new_in_memory().unwrap();
        let key = CacheKey::header("idx", "f");
        store
            .put(key.clone(), CacheValue::Header(FileHeaderValue::new(1, 0)))
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap().is_some());
        store.remove(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
