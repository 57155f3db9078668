//! # Distributed locks
//!
//! Short-lived named locks shared by every replica of the registry. A lock is
//! a key holding a random holder value with an expiry; only the holder can
//! renew or release it. Two backends are provided: Redis and an embedded
//! key-value file.

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

mod embedded;
mod redis_lock;

pub use crate::embedded::EmbeddedLockBackend;
pub use crate::redis_lock::RedisLockBackend;

/// Locks shorter than this are rejected.
pub const MIN_EXPIRE: Duration = Duration::from_millis(100);

/// How often a contended acquire retries, and how often renewal runs.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock failures.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The requested expiry is below [`MIN_EXPIRE`].
    #[error("lock expiry {0:?} is shorter than the {MIN_EXPIRE:?} minimum")]
    LockTooShort(Duration),

    /// The lock stayed held by someone else for the whole wait.
    #[error("timed out waiting for lock {0}")]
    Timeout(String),

    /// The lock is gone or held by someone else.
    #[error("lock {0} is not held by this holder")]
    LockNotHeld(String),

    /// The lock expired before it was renewed.
    #[error("lock {0} has already expired")]
    LockAlreadyExpired(String),

    /// The backing store failed.
    #[error("lock backend error")]
    Backend(#[source] Box<dyn StdError + Send + Sync + 'static>),
}

impl LockError {
    pub(crate) fn backend<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        LockError::Backend(err.into())
    }
}

/// Storage for lock rows.
#[async_trait::async_trait]
pub trait LockBackend: fmt::Debug + Send + Sync {
    /// Create the row if it is absent (or expired). Returns whether this call
    /// now holds the lock.
    async fn try_acquire(&self, key: &str, value: &str, expire: Duration)
        -> Result<bool, LockError>;

    /// Push the row's expiry out by `expire`, if `value` still holds it.
    async fn renew(&self, key: &str, value: &str, expire: Duration) -> Result<(), LockError>;

    /// Remove the row if `value` still holds it.
    async fn release(&self, key: &str, value: &str) -> Result<(), LockError>;
}

/// Acquires named locks against a backend.
#[derive(Debug, Clone)]
pub struct Locker {
    backend: Arc<dyn LockBackend>,
    prefix: String,
}

impl Locker {
    /// Create a locker. Every key is stored as `<prefix>:<key>`.
    pub fn new<B>(backend: B, prefix: impl Into<String>) -> Self
    where
        B: LockBackend + 'static,
    {
        Self {
            backend: Arc::new(backend),
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }

    /// Acquire `key` for `expire`, polling every [`POLL_INTERVAL`] for up to
    /// `wait` while someone else holds it.
    #[tracing::instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn acquire(
        &self,
        key: &str,
        expire: Duration,
        wait: Duration,
    ) -> Result<Lock, LockError> {
        if expire < MIN_EXPIRE {
            return Err(LockError::LockTooShort(expire));
        }

        let key = self.key(key);
        let value = holder_value();
        let deadline = Instant::now() + wait;

        loop {
            let attempt = Instant::now();
            if self.backend.try_acquire(&key, &value, expire).await? {
                tracing::debug!(%key, "lock acquired");
                return Ok(Lock {
                    backend: Arc::clone(&self.backend),
                    key,
                    value,
                    expire,
                    valid_until: Mutex::new(attempt + expire),
                });
            }

            if Instant::now() + POLL_INTERVAL > deadline {
                return Err(LockError::Timeout(key));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Acquire like [`Locker::acquire`], then keep the lock alive until
    /// `cancel` fires or the returned guard is unlocked.
    ///
    /// The renewer runs every [`POLL_INTERVAL`]. On cancellation it releases
    /// the lock on a best-effort basis.
    pub async fn acquire_with_renew(
        &self,
        cancel: CancellationToken,
        key: &str,
        expire: Duration,
        wait: Duration,
    ) -> Result<RenewedLock, LockError> {
        let lock = Arc::new(self.acquire(key, expire, wait).await?);
        let lost = Arc::new(AtomicBool::new(false));
        let stop = cancel.child_token();

        let task = {
            let lock = Arc::clone(&lock);
            let lost = Arc::clone(&lost);
            let stop = stop.clone();
            tokio::spawn(
                async move {
                    let mut ticker = tokio::time::interval(POLL_INTERVAL);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = stop.cancelled() => break,
                            _ = ticker.tick() => {
                                if let Err(error) = lock.renew().await {
                                    tracing::warn!(key = %lock.key, %error, "lost lock during renewal");
                                    lost.store(true, Ordering::SeqCst);
                                    return;
                                }
                            }
                        }
                    }
                    if let Err(error) = lock.release().await {
                        tracing::debug!(key = %lock.key, %error, "release after cancellation failed");
                    }
                }
                .in_current_span(),
            )
        };

        Ok(RenewedLock {
            lock,
            lost,
            stop,
            task: Some(task),
        })
    }
}

fn holder_value() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}-{nanos}", uuid::Uuid::new_v4())
}

/// A held lock.
pub struct Lock {
    backend: Arc<dyn LockBackend>,
    key: String,
    value: String,
    expire: Duration,
    valid_until: Mutex<Instant>,
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("expire", &self.expire)
            .finish_non_exhaustive()
    }
}

impl Lock {
    /// The stored key, including the locker prefix.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the lock by its original expiry.
    pub async fn renew(&self) -> Result<(), LockError> {
        let now = Instant::now();
        if now > *self.valid_until.lock() {
            return Err(LockError::LockAlreadyExpired(self.key.clone()));
        }
        self.backend.renew(&self.key, &self.value, self.expire).await?;
        *self.valid_until.lock() = now + self.expire;
        Ok(())
    }

    async fn release(&self) -> Result<(), LockError> {
        self.backend.release(&self.key, &self.value).await
    }

    /// Release the lock.
    pub async fn unlock(self) -> Result<(), LockError> {
        self.release().await?;
        tracing::debug!(key = %self.key, "lock released");
        Ok(())
    }
}

/// A lock kept alive by a background renewer.
#[derive(Debug)]
pub struct RenewedLock {
    lock: Arc<Lock>,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RenewedLock {
    /// The stored key, including the locker prefix.
    pub fn key(&self) -> &str {
        self.lock.key()
    }

    /// Whether renewal failed and the lock may now belong to someone else.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing and release the lock.
    pub async fn unlock(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                tracing::warn!(key = %self.lock.key, %error, "lock renewer panicked");
            }
        }
    }
}

impl Drop for RenewedLock {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
