//! Content-addressed blobs. Blobs are global; repositories reach them
//! through the artifacts that reference them.

use std::collections::HashSet;

use serde::Serialize;
use sqlx::AnyConnection;

use super::{DalError, DalResult, now_ms, placeholders};

/// A blob row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Blob {
    pub id: i64,
    pub digest: String,
    pub size: i64,
    pub content_type: String,
    pub pushed_at: i64,
    pub last_pull: i64,
    pub pull_times: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

const COLUMNS: &str =
    "id, digest, size, content_type, pushed_at, last_pull, pull_times, created_at, updated_at";

/// Record a committed blob, or refresh `last_pull` if it is already known.
/// Pushing a blob again counts as use, so GC leaves it alone for another
/// retention window.
pub async fn upsert(
    conn: &mut AnyConnection,
    digest: &str,
    size: i64,
    content_type: &str,
) -> DalResult<Blob> {
    let now = now_ms();
    sqlx::query(
        "INSERT INTO blobs (digest, size, content_type, pushed_at, last_pull, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $4, $4, $4) \
         ON CONFLICT (digest) DO UPDATE SET last_pull = excluded.last_pull, \
         updated_at = excluded.updated_at",
    )
    .bind(digest)
    .bind(size)
    .bind(content_type)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    find_by_digest(conn, digest)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("blob {digest}")))
}

/// Look a blob up by digest.
pub async fn find_by_digest(conn: &mut AnyConnection, digest: &str) -> DalResult<Option<Blob>> {
    Ok(
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM blobs WHERE digest = $1"))
            .bind(digest)
            .fetch_optional(conn)
            .await?,
    )
}

/// Every known blob among `digests`.
pub async fn find_many(conn: &mut AnyConnection, digests: &[String]) -> DalResult<Vec<Blob>> {
    if digests.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {COLUMNS} FROM blobs WHERE digest IN ({})",
        placeholders(1, digests.len())
    );
    let mut query = sqlx::query_as::<sqlx::Any, Blob>(&sql);
    for digest in digests {
        query = query.bind(digest);
    }
    Ok(query.fetch_all(conn).await?)
}

/// Record a pull.
pub async fn touch_pull(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query("UPDATE blobs SET last_pull = $2, pull_times = pull_times + 1 WHERE id = $1")
        .bind(id)
        .bind(now_ms())
        .execute(conn)
        .await?;
    Ok(())
}

/// Blobs not pulled since `before`, one page ordered by id.
pub async fn list_stale_after(
    conn: &mut AnyConnection,
    before: i64,
    after_id: i64,
    limit: i64,
) -> DalResult<Vec<Blob>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM blobs WHERE last_pull < $1 AND id > $2 ORDER BY id LIMIT $3"
    ))
    .bind(before)
    .bind(after_id)
    .bind(limit)
    .fetch_all(conn)
    .await?)
}

/// The subset of `ids` that some artifact still references.
pub async fn referenced_ids(conn: &mut AnyConnection, ids: &[i64]) -> DalResult<HashSet<i64>> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let sql = format!(
        "SELECT DISTINCT blob_id FROM artifact_blobs WHERE blob_id IN ({})",
        placeholders(1, ids.len())
    );
    let mut query = sqlx::query_scalar::<sqlx::Any, i64>(&sql);
    for id in ids {
        query = query.bind(*id);
    }
    Ok(query.fetch_all(conn).await?.into_iter().collect())
}

/// Whether any artifact references the blob.
pub async fn is_referenced(conn: &mut AnyConnection, id: i64) -> DalResult<bool> {
    Ok(!referenced_ids(conn, &[id]).await?.is_empty())
}

/// Delete a blob row unless it was pushed or pulled at or after `before`.
/// Returns `false` if the row was refreshed in the meantime.
pub async fn delete_stale(conn: &mut AnyConnection, id: i64, before: i64) -> DalResult<bool> {
    let result = sqlx::query("DELETE FROM blobs WHERE id = $1 AND last_pull < $2")
        .bind(id)
        .bind(before)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::testing;

    #[tokio::test]
    async fn upsert_refreshes_last_pull() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();

        let first = upsert(&mut conn, "sha256:aa", 4, "application/octet-stream")
            .await
            .unwrap();
        sqlx::query("UPDATE blobs SET last_pull = 0 WHERE id = $1")
            .bind(first.id)
            .execute(&mut *conn)
            .await
            .unwrap();
        assert_eq!(
            list_stale_after(&mut conn, now_ms(), 0, 10).await.unwrap().len(),
            1
        );

        let second = upsert(&mut conn, "sha256:aa", 4, "application/octet-stream")
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.last_pull > 0);

        let found = find_many(&mut conn, &["sha256:aa".into(), "sha256:bb".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(!is_referenced(&mut conn, first.id).await.unwrap());
    }

    #[tokio::test]
    async fn refreshed_blobs_survive_a_stale_delete() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();

        let blob = upsert(&mut conn, "sha256:cc", 4, "application/octet-stream")
            .await
            .unwrap();
        let listed_before = blob.last_pull;
        // re-pushed after the sweeper picked its cutoff
        assert!(!delete_stale(&mut conn, blob.id, listed_before).await.unwrap());
        assert!(find_by_digest(&mut conn, "sha256:cc").await.unwrap().is_some());

        assert!(delete_stale(&mut conn, blob.id, listed_before + 1).await.unwrap());
        assert!(find_by_digest(&mut conn, "sha256:cc").await.unwrap().is_none());
    }
}
