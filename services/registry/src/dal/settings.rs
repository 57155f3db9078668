//! Process-wide key/value settings.

use sqlx::AnyConnection;

use super::{DalResult, now_ms};

/// The value stored under `key`.
pub async fn get(conn: &mut AnyConnection, key: &str) -> DalResult<Option<Vec<u8>>> {
    let value = sqlx::query_scalar("SELECT val FROM settings WHERE name = $1")
        .bind(key)
        .fetch_optional(conn)
        .await?;
    Ok(value)
}

/// Store `value` under `key`, replacing any previous value.
pub async fn set(conn: &mut AnyConnection, key: &str, value: &[u8]) -> DalResult<()> {
    sqlx::query(
        "INSERT INTO settings (name, val, updated_at) VALUES ($1, $2, $3) \
         ON CONFLICT (name) DO UPDATE SET val = excluded.val, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(now_ms())
    .execute(conn)
    .await?;
    Ok(())
}

/// Remove `key`.
pub async fn delete(conn: &mut AnyConnection, key: &str) -> DalResult<()> {
    sqlx::query("DELETE FROM settings WHERE name = $1")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::testing;

    #[tokio::test]
    async fn set_replaces() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();

        assert_eq!(get(&mut conn, "key").await.unwrap(), None);
        set(&mut conn, "key", b"one").await.unwrap();
        set(&mut conn, "key", b"two").await.unwrap();
        assert_eq!(get(&mut conn, "key").await.unwrap(), Some(b"two".to_vec()));
        delete(&mut conn, "key").await.unwrap();
        assert_eq!(get(&mut conn, "key").await.unwrap(), None);
    }
}
