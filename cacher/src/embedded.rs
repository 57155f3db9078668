use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};

use crate::{CacheBackend, CacheError};

const CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("cache");

/// Cache entries stored in an embedded key-value file.
///
/// Each value is prefixed with its expiry as big-endian epoch milliseconds,
/// zero meaning "never".
#[derive(Debug, Clone)]
pub struct EmbeddedCache {
    db: Arc<Database>,
}

fn encode(value: &[u8], ttl: Option<Duration>) -> Vec<u8> {
    let expires = ttl
        .map(|ttl| {
            Utc::now()
                .timestamp_millis()
                .saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        })
        .unwrap_or(0);
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&expires.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode(stored: &[u8]) -> Option<Vec<u8>> {
    if stored.len() < 8 {
        return None;
    }
    let (head, value) = stored.split_at(8);
    let expires = i64::from_be_bytes(head.try_into().ok()?);
    if expires != 0 && expires <= Utc::now().timestamp_millis() {
        return None;
    }
    Some(value.to_vec())
}

impl EmbeddedCache {
    /// Use an already opened database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let db = Database::create(path).map_err(CacheError::backend)?;
        Ok(Self::new(Arc::new(db)))
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Database) -> Result<R, redb::Error> + Send + 'static,
        R: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(CacheError::backend)?
            .map_err(CacheError::backend)
    }
}

#[async_trait::async_trait]
impl CacheBackend for EmbeddedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = key.to_owned();
        let stored = self
            .blocking(move |db| {
                let txn = db.begin_read()?;
                let table = match txn.open_table(CACHE) {
                    Ok(table) => table,
                    Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                    Err(err) => return Err(err.into()),
                };
                let value = table.get(key.as_str())?.map(|guard| guard.value().to_vec());
                Ok(value)
            })
            .await?;
        Ok(stored.as_deref().and_then(decode))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let key = key.to_owned();
        let stored = encode(&value, ttl);
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(CACHE)?;
                table.insert(key.as_str(), stored.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_owned();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(CACHE)?;
                table.remove(key.as_str())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_persist_and_expire() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddedCache::open(dir.path().join("cache.redb")).unwrap();

        assert_eq!(cache.get("missing").await.unwrap(), None);
        cache.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));

        cache
            .set("short", b"x".to_vec(), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("short").await.unwrap(), None);

        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
