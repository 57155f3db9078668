//! # Read-through caches
//!
//! A [`Cacher`] maps string keys to typed values. On a miss it calls the
//! fetcher it was built with, stores the result, and returns it. Concurrent
//! misses for the same key share one fetch.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

mod embedded;
mod flight;
mod memory;
mod redis_cache;

pub use crate::embedded::EmbeddedCache;
pub use crate::memory::MemoryCache;
pub use crate::redis_cache::RedisCache;

pub use crate::flight::BoxFut;
use crate::flight::Flight;

/// Default capacity of the in-memory cache.
pub const DEFAULT_MEMORY_ENTRIES: usize = 1024;

/// Cache failures. Cloneable so one fetch result can be shared by every
/// waiting caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The backing store failed.
    #[error("cache backend error")]
    Backend(#[source] Arc<dyn StdError + Send + Sync + 'static>),

    /// A stored value could not be encoded or decoded.
    #[error("cache value codec error")]
    Codec(#[source] Arc<serde_json::Error>),

    /// The fetcher failed.
    #[error("fetching {key} failed: {message}")]
    Fetch {
        /// The key being fetched.
        key: String,
        /// Rendered fetcher error.
        message: String,
    },

    /// The coalesced fetch went away without a result.
    #[error("coalesced fetch for {0} was dropped")]
    Dropped(String),
}

impl CacheError {
    pub(crate) fn backend<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        CacheError::Backend(Arc::new(err))
    }

    /// Wrap a fetcher error for `key`.
    pub fn fetch(key: impl Into<String>, err: impl fmt::Display) -> Self {
        CacheError::Fetch {
            key: key.into(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(value: serde_json::Error) -> Self {
        CacheError::Codec(Arc::new(value))
    }
}

/// Byte storage behind a [`Cacher`].
#[async_trait::async_trait]
pub trait CacheBackend: fmt::Debug + Send + Sync {
    /// The stored bytes, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store bytes, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
        -> Result<(), CacheError>;

    /// Remove a key. Missing keys are not an error.
    async fn del(&self, key: &str) -> Result<(), CacheError>;
}

/// Loads a value on a cache miss.
pub type Fetcher<T> =
    Arc<dyn Fn(String) -> BoxFut<'static, Result<T, CacheError>> + Send + Sync + 'static>;

/// A typed read-through cache.
pub struct Cacher<T> {
    backend: Arc<dyn CacheBackend>,
    prefix: String,
    ttl: Option<Duration>,
    fetcher: Fetcher<T>,
    flights: Arc<Mutex<HashMap<String, Flight<Result<T, CacheError>>>>>,
}

impl<T> Clone for Cacher<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            prefix: self.prefix.clone(),
            ttl: self.ttl,
            fetcher: Arc::clone(&self.fetcher),
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<T> fmt::Debug for Cacher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cacher")
            .field("backend", &self.backend)
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl<T> Cacher<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Build a cache. Keys are stored as `<prefix>:<cache_prefix>:<key>`.
    pub fn new<F, Fut>(
        backend: Arc<dyn CacheBackend>,
        prefix: &str,
        cache_prefix: &str,
        ttl: Option<Duration>,
        fetcher: F,
    ) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let fetcher: Fetcher<T> =
            Arc::new(move |key| -> BoxFut<'static, Result<T, CacheError>> { Box::pin(fetcher(key)) });
        Self {
            backend,
            prefix: format!("{prefix}:{cache_prefix}"),
            ttl,
            fetcher,
            flights: Arc::default(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    /// The cached value for `key`, fetching and storing it on a miss.
    #[tracing::instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn get(&self, key: &str) -> Result<T, CacheError> {
        let full = self.key(key);
        if let Some(bytes) = self.backend.get(&full).await? {
            match serde_json::from_slice(&bytes) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    tracing::warn!(key = %full, %error, "dropping undecodable cache entry");
                    self.backend.del(&full).await?;
                }
            }
        }

        let flight = self.flights.lock().entry(full.clone()).or_default().clone();
        let handle = flight.handle(|| {
            let fetcher = Arc::clone(&self.fetcher);
            let backend = Arc::clone(&self.backend);
            let flights = Arc::clone(&self.flights);
            let ttl = self.ttl;
            let key = key.to_owned();
            let full = full.clone();
            Box::pin(async move {
                let result: Result<T, CacheError> = async {
                    let value = fetcher(key).await?;
                    backend.set(&full, serde_json::to_vec(&value)?, ttl).await?;
                    Ok(value)
                }
                .await;
                flights.lock().remove(&full);
                result
            })
        });

        handle.await.map_err(|_| CacheError::Dropped(full))?
    }

    /// Store `value` under `key`. `None` uses the cache's default TTL.
    pub async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.backend
            .set(&self.key(key), bytes, ttl.or(self.ttl))
            .await
    }

    /// Remove `key`.
    pub async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.backend.del(&self.key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static_assertions::assert_obj_safe!(CacheBackend);

    fn counting(calls: Arc<AtomicUsize>) -> Cacher<String> {
        Cacher::new(
            Arc::new(MemoryCache::new(16)),
            "registry",
            "names",
            None,
            move |key: String| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(format!("value-of-{key}"))
                }
            },
        )
    }

    #[tokio::test]
    async fn miss_fetches_once_then_hits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting(Arc::clone(&calls));

        assert_eq!(cache.get("a").await.unwrap(), "value-of-a");
        assert_eq!(cache.get("a").await.unwrap(), "value-of-a");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.del("a").await.unwrap();
        cache.get("a").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting(Arc::clone(&calls));

        let (a, b, c) = tokio::join!(cache.get("k"), cache.get("k"), cache.get("k"));
        assert_eq!(a.unwrap(), "value-of-k");
        assert_eq!(b.unwrap(), "value-of-k");
        assert_eq!(c.unwrap(), "value-of-k");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn set_overrides_and_uses_composed_key() {
        let backend = Arc::new(MemoryCache::new(16));
        let cache: Cacher<u64> = Cacher::new(
            backend.clone(),
            "p",
            "c",
            None,
            |key: String| async move { Err(CacheError::fetch(key, "no fetcher")) },
        );

        cache.set("x", &42, None).await.unwrap();
        assert!(backend.get("p:c:x").await.unwrap().is_some());
        assert_eq!(cache.get("x").await.unwrap(), 42);

        let err = cache.get("missing").await.unwrap_err();
        assert!(matches!(err, CacheError::Fetch { .. }));
    }
}
