use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Script;

use crate::{LockBackend, LockError};

const RENEW: &str = r#"
local current = redis.call("GET", KEYS[1])
if not current then
    return 0
end
if current ~= ARGV[1] then
    return -1
end
redis.call("PEXPIRE", KEYS[1], ARGV[2])
return 1
"#;

const RELEASE: &str = r#"
local current = redis.call("GET", KEYS[1])
if not current then
    return 0
end
if current ~= ARGV[1] then
    return -1
end
redis.call("DEL", KEYS[1])
return 1
"#;

/// Locks stored as Redis keys with a millisecond TTL.
#[derive(Clone)]
pub struct RedisLockBackend {
    conn: ConnectionManager,
    renew: Script,
    release: Script,
}

impl std::fmt::Debug for RedisLockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockBackend").finish_non_exhaustive()
    }
}

impl RedisLockBackend {
    /// Use an existing managed connection.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            renew: Script::new(RENEW),
            release: Script::new(RELEASE),
        }
    }

    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(LockError::backend)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(LockError::backend)?;
        Ok(Self::new(conn))
    }
}

fn millis(expire: Duration) -> u64 {
    u64::try_from(expire.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait::async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_acquire(
        &self,
        key: &str,
        value: &str,
        expire: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(expire))
            .query_async(&mut conn)
            .await
            .map_err(LockError::backend)?;
        Ok(reply.is_some())
    }

    async fn renew(&self, key: &str, value: &str, expire: Duration) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let status: i64 = self
            .renew
            .key(key)
            .arg(value)
            .arg(millis(expire))
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::backend)?;
        match status {
            1 => Ok(()),
            _ => Err(LockError::LockNotHeld(key.to_owned())),
        }
    }

    async fn release(&self, key: &str, value: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let status: i64 = self
            .release
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::backend)?;
        match status {
            -1 => Err(LockError::LockNotHeld(key.to_owned())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Locker;

    fn redis_url() -> Option<String> {
        std::env::var("REDIS_URL").ok()
    }

    #[tokio::test]
    #[ignore = "needs a Redis server in REDIS_URL"]
    async fn redis_lock_excludes_second_holder() {
        let Some(url) = redis_url() else { return };
        let locker = Locker::new(RedisLockBackend::connect(&url).await.unwrap(), "locker-test");

        let held = locker
            .acquire("exclusive", Duration::from_secs(2), Duration::ZERO)
            .await
            .unwrap();
        let err = locker
            .acquire("exclusive", Duration::from_secs(2), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout(_)));

        held.renew().await.unwrap();
        held.unlock().await.unwrap();
        locker
            .acquire("exclusive", Duration::from_secs(2), Duration::ZERO)
            .await
            .unwrap()
            .unlock()
            .await
            .unwrap();
    }
}
