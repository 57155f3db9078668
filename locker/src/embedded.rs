use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::{LockBackend, LockError};

const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    value: String,
    expires_at: i64,
}

impl Row {
    fn expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Locks stored in an embedded key-value file.
///
/// Only one process may open the file, so this backend suits single-node
/// deployments. The database handle can be shared with other users of the
/// same file.
#[derive(Debug, Clone)]
pub struct EmbeddedLockBackend {
    db: Arc<Database>,
}

enum Outcome {
    Acquired(bool),
    Done,
    NotHeld,
    Expired,
}

impl EmbeddedLockBackend {
    /// Use an already opened database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LockError> {
        let db = Database::create(path).map_err(LockError::backend)?;
        Ok(Self::new(Arc::new(db)))
    }

    async fn update<F>(&self, key: &str, f: F) -> Result<Outcome, LockError>
    where
        F: FnOnce(Option<Row>, i64) -> (Option<Option<Row>>, Outcome) + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || -> Result<Outcome, LockError> {
            let txn = db.begin_write().map_err(LockError::backend)?;
            let outcome = {
                let mut table = txn.open_table(LOCKS).map_err(LockError::backend)?;
                let existing = table
                    .get(key.as_str())
                    .map_err(LockError::backend)?
                    .map(|guard| guard.value().to_vec());
                let row = match existing {
                    Some(bytes) => Some(serde_json::from_slice::<Row>(&bytes).map_err(LockError::backend)?),
                    None => None,
                };

                let (write, outcome) = f(row, Utc::now().timestamp_millis());
                match write {
                    Some(Some(row)) => {
                        let bytes = serde_json::to_vec(&row).map_err(LockError::backend)?;
                        table
                            .insert(key.as_str(), bytes.as_slice())
                            .map_err(LockError::backend)?;
                    }
                    Some(None) => {
                        table.remove(key.as_str()).map_err(LockError::backend)?;
                    }
                    None => {}
                }
                outcome
            };
            txn.commit().map_err(LockError::backend)?;
            Ok(outcome)
        })
        .await
        .map_err(LockError::backend)?
    }
}

fn expiry(now: i64, expire: Duration) -> i64 {
    now.saturating_add(i64::try_from(expire.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait::async_trait]
impl LockBackend for EmbeddedLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        value: &str,
        expire: Duration,
    ) -> Result<bool, LockError> {
        let value = value.to_owned();
        let outcome = self
            .update(key, move |row, now| match row {
                Some(row) if !row.expired(now) => (None, Outcome::Acquired(false)),
                _ => {
                    let row = Row {
                        value,
                        expires_at: expiry(now, expire),
                    };
                    (Some(Some(row)), Outcome::Acquired(true))
                }
            })
            .await?;
        Ok(matches!(outcome, Outcome::Acquired(true)))
    }

    async fn renew(&self, key: &str, value: &str, expire: Duration) -> Result<(), LockError> {
        let value = value.to_owned();
        let outcome = self
            .update(key, move |row, now| match row {
                Some(row) if row.value != value => (None, Outcome::NotHeld),
                Some(row) if row.expired(now) => (None, Outcome::Expired),
                Some(_) => {
                    let row = Row {
                        value,
                        expires_at: expiry(now, expire),
                    };
                    (Some(Some(row)), Outcome::Done)
                }
                None => (None, Outcome::NotHeld),
            })
            .await?;
        match outcome {
            Outcome::NotHeld => Err(LockError::LockNotHeld(key.to_owned())),
            Outcome::Expired => Err(LockError::LockAlreadyExpired(key.to_owned())),
            _ => Ok(()),
        }
    }

    async fn release(&self, key: &str, value: &str) -> Result<(), LockError> {
        let value = value.to_owned();
        let outcome = self
            .update(key, move |row, _| match row {
                Some(row) if row.value == value => (Some(None), Outcome::Done),
                Some(_) => (None, Outcome::NotHeld),
                None => (None, Outcome::Done),
            })
            .await?;
        match outcome {
            Outcome::NotHeld => Err(LockError::LockNotHeld(key.to_owned())),
            _ => Ok(()),
        }
    }
}
