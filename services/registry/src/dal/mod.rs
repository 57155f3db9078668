//! Data access layer.
//!
//! Hand-written SQL over a sqlx [`AnyPool`] so the same queries run against
//! sqlite and PostgreSQL. Every repository function takes a
//! `&mut AnyConnection`, which is either a pooled connection or the
//! connection inside a [`Tx`].
//!
//! Portability rules for the queries in this module: `$N` placeholders,
//! `BIGINT` for every integer (booleans are `0`/`1`), timestamps as epoch
//! milliseconds, and aggregates cast back to `BIGINT`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::AnyConnection;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool};

use crate::config::{DatabaseConfig, DatabaseType};

pub mod artifacts;
pub mod blobs;
pub mod gc;
pub mod namespaces;
pub mod repositories;
mod schema;
pub mod settings;
pub mod tags;
pub mod uploads;
pub mod users;
pub mod webhooks;
pub mod work_queue;

/// Errors from the data access layer.
#[derive(Debug, thiserror::Error)]
pub enum DalError {
    /// The entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// A unique constraint was violated.
    #[error("{0} already exists")]
    Conflict(String),

    /// A stored value could not be interpreted.
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),

    /// The migration lock could not be taken.
    #[error("migration lock: {0}")]
    Lock(#[from] locker::LockError),

    /// Anything the driver reports.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DalError {
    /// Turn a unique violation into [`DalError::Conflict`].
    pub(crate) fn unique(what: impl fmt::Display) -> impl FnOnce(sqlx::Error) -> DalError {
        move |err| match err.as_database_error() {
            Some(db) if db.is_unique_violation() => DalError::Conflict(what.to_string()),
            _ => DalError::Sqlx(err),
        }
    }
}

/// Result type for the data access layer.
pub type DalResult<T> = Result<T, DalError>;

/// Milliseconds since the epoch, the unit of every timestamp column.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `now - age` in epoch milliseconds.
pub fn ms_ago(age: Duration) -> i64 {
    now_ms() - i64::try_from(age.as_millis()).unwrap_or(i64::MAX / 2)
}

/// `$start, $start+1, ...` for an `IN (...)` list of `count` values.
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The SQL dialect behind the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// sqlite
    Sqlite,
    /// PostgreSQL
    Postgres,
}

/// Handle to the metadata database.
#[derive(Debug, Clone)]
pub struct Dal {
    pool: AnyPool,
    dialect: Dialect,
}

impl Dal {
    /// Open a pool for the configured database.
    #[tracing::instrument(skip(config), fields(database = ?config.kind))]
    pub async fn connect(config: &DatabaseConfig) -> DalResult<Self> {
        sqlx::any::install_default_drivers();

        let dialect = match config.kind {
            DatabaseType::Sqlite3 => Dialect::Sqlite,
            DatabaseType::Postgresql | DatabaseType::Mysql => Dialect::Postgres,
        };

        // sqlite gets a single connection: one writer at a time, and an
        // in-memory database lives exactly as long as its connection.
        let options = match dialect {
            Dialect::Sqlite => AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
            Dialect::Postgres => AnyPoolOptions::new().max_connections(config.max_connections),
        };

        let pool = options.connect(&config.url()).await?;
        tracing::info!(?dialect, "database connected");
        Ok(Self { pool, dialect })
    }

    /// An in-memory sqlite database, migrated.
    pub async fn memory() -> DalResult<Self> {
        let mut config = DatabaseConfig::default();
        config.sqlite3.path = ":memory:".into();
        let dal = Self::connect(&config).await?;
        dal.create_schema().await?;
        Ok(dal)
    }

    /// The SQL dialect in use.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Borrow a connection from the pool.
    pub async fn acquire(&self) -> DalResult<PoolConnection<Any>> {
        Ok(self.pool.acquire().await?)
    }

    /// Start a transaction.
    pub async fn begin(&self) -> DalResult<Tx> {
        Ok(Tx {
            inner: self.pool.begin().await?,
            hooks: Vec::new(),
        })
    }

    /// Round trip to the database.
    pub async fn ping(&self) -> DalResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Create missing tables while holding the `schema-migration` lock, so
    /// replicas starting together don't race each other.
    #[tracing::instrument(skip_all)]
    pub async fn migrate(&self, locker: &locker::Locker) -> DalResult<()> {
        let lock = locker
            .acquire(
                "schema-migration",
                Duration::from_secs(30),
                Duration::from_secs(60),
            )
            .await?;
        let result = self.create_schema().await;
        lock.unlock().await?;
        result
    }

    async fn create_schema(&self) -> DalResult<()> {
        let mut tx = self.pool.begin().await?;
        for statement in schema::statements(self.dialect) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        tracing::debug!("schema up to date");
        Ok(())
    }
}

type Hook = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A database transaction that runs hooks once it has committed.
///
/// Hooks are how side effects that live outside the database (queue
/// messages on Redis, Kafka or in memory) become visible exactly when the
/// rows they describe do. Dropping a `Tx` rolls back and discards the hooks.
pub struct Tx {
    inner: sqlx::Transaction<'static, Any>,
    hooks: Vec<Hook>,
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx").field("hooks", &self.hooks.len()).finish()
    }
}

impl Tx {
    /// The connection inside the transaction.
    pub fn conn(&mut self) -> &mut AnyConnection {
        &mut *self.inner
    }

    /// Run `hook` after a successful commit.
    pub fn after_commit<F>(&mut self, hook: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.hooks.push(Box::pin(hook));
    }

    /// Commit, then run the hooks in registration order.
    pub async fn commit(self) -> DalResult<()> {
        self.inner.commit().await?;
        for hook in self.hooks {
            hook.await;
        }
        Ok(())
    }

    /// Roll back and drop the hooks.
    pub async fn rollback(self) -> DalResult<()> {
        self.inner.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A migrated in-memory database.
    pub async fn dal() -> Dal {
        Dal::memory().await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn hooks_run_only_after_commit() {
        let dal = testing::dal().await;

        let fired = Arc::new(AtomicBool::new(false));
        let mut tx = dal.begin().await.unwrap();
        let flag = fired.clone();
        tx.after_commit(async move { flag.store(true, Ordering::SeqCst) });
        tx.rollback().await.unwrap();
        assert!(!fired.load(Ordering::SeqCst));

        let mut tx = dal.begin().await.unwrap();
        let flag = fired.clone();
        tx.after_commit(async move { flag.store(true, Ordering::SeqCst) });
        settings::set(tx.conn(), "k", b"v").await.unwrap();
        tx.commit().await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = redb::Database::create(dir.path().join("locks.redb")).unwrap();
        let locker =
            locker::Locker::new(locker::EmbeddedLockBackend::new(Arc::new(db)), "test");

        let dal = testing::dal().await;
        dal.migrate(&locker).await.unwrap();
        dal.migrate(&locker).await.unwrap();
        dal.ping().await.unwrap();
    }

    #[test]
    fn placeholder_lists() {
        assert_eq!(placeholders(1, 3), "$1, $2, $3");
        assert_eq!(placeholders(4, 1), "$4");
    }
}
