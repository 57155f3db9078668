//! Repositories: named collections of artifacts and tags inside a namespace.

use std::collections::HashSet;

use serde::Serialize;
use sqlx::AnyConnection;

use super::namespaces::Namespace;
use super::{DalError, DalResult, now_ms, placeholders};
use crate::config::Visibility;

/// A repository row. `name` is the full path, namespace included.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Repository {
    pub id: i64,
    pub namespace_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub visibility: String,
    pub size: i64,
    pub size_limit: i64,
    pub tag_count: i64,
    pub tag_limit: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

const COLUMNS: &str = "id, namespace_id, name, description, visibility, size, size_limit, \
                       tag_count, tag_limit, created_at, updated_at";

/// Look a repository up by full name.
pub async fn find_by_name(conn: &mut AnyConnection, name: &str) -> DalResult<Option<Repository>> {
    Ok(
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM repositories WHERE name = $1"))
            .bind(name)
            .fetch_optional(conn)
            .await?,
    )
}

/// Look a repository up by id.
pub async fn get(conn: &mut AnyConnection, id: i64) -> DalResult<Repository> {
    sqlx::query_as(&format!("SELECT {COLUMNS} FROM repositories WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("repository {id}")))
}

/// The repository called `name` in `namespace`, and whether it was created
/// by this call.
pub async fn get_or_create(
    conn: &mut AnyConnection,
    namespace: &Namespace,
    name: &str,
    visibility: Visibility,
) -> DalResult<(Repository, bool)> {
    if let Some(existing) = find_by_name(&mut *conn, name).await? {
        return Ok((existing, false));
    }
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO repositories (namespace_id, name, visibility, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $4) RETURNING id",
    )
    .bind(namespace.id)
    .bind(name)
    .bind(visibility.as_str())
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(DalError::unique(format!("repository {name}")))?;
    Ok((get(conn, id).await?, true))
}

/// Number of repositories in a namespace.
pub async fn count_in_namespace(conn: &mut AnyConnection, namespace_id: i64) -> DalResult<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM repositories WHERE namespace_id = $1")
            .bind(namespace_id)
            .fetch_one(conn)
            .await?,
    )
}

/// One page of repositories ordered by id, optionally within one namespace.
pub async fn list_after(
    conn: &mut AnyConnection,
    namespace_id: Option<i64>,
    after_id: i64,
    limit: i64,
) -> DalResult<Vec<Repository>> {
    let rows = match namespace_id {
        Some(namespace_id) => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM repositories WHERE namespace_id = $1 AND id > $2 \
                 ORDER BY id LIMIT $3"
            ))
            .bind(namespace_id)
            .bind(after_id)
            .bind(limit)
            .fetch_all(conn)
            .await?
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM repositories WHERE id > $1 ORDER BY id LIMIT $2"
            ))
            .bind(after_id)
            .bind(limit)
            .fetch_all(conn)
            .await?
        }
    };
    Ok(rows)
}

/// One page of repositories that hold no artifacts and no tags.
pub async fn list_empty_after(
    conn: &mut AnyConnection,
    namespace_id: Option<i64>,
    after_id: i64,
    limit: i64,
) -> DalResult<Vec<Repository>> {
    let empty = "NOT EXISTS (SELECT 1 FROM artifacts a WHERE a.repository_id = repositories.id) \
                 AND NOT EXISTS (SELECT 1 FROM tags t WHERE t.repository_id = repositories.id)";
    let rows = match namespace_id {
        Some(namespace_id) => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM repositories WHERE namespace_id = $1 AND id > $2 \
                 AND {empty} ORDER BY id LIMIT $3"
            ))
            .bind(namespace_id)
            .bind(after_id)
            .bind(limit)
            .fetch_all(conn)
            .await?
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM repositories WHERE id > $1 AND {empty} \
                 ORDER BY id LIMIT $2"
            ))
            .bind(after_id)
            .bind(limit)
            .fetch_all(conn)
            .await?
        }
    };
    Ok(rows)
}

/// Whether a repository still holds artifacts or tags.
pub async fn is_empty(conn: &mut AnyConnection, id: i64) -> DalResult<bool> {
    let used: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM artifacts WHERE repository_id = $1) \
              + (SELECT COUNT(*) FROM tags WHERE repository_id = $1)",
    )
    .bind(id)
    .fetch_one(conn)
    .await?;
    Ok(used == 0)
}

/// The subset of `blob_ids` some artifact of the repository already references.
pub async fn referenced_blob_ids(
    conn: &mut AnyConnection,
    id: i64,
    blob_ids: &[i64],
) -> DalResult<HashSet<i64>> {
    if blob_ids.is_empty() {
        return Ok(HashSet::new());
    }
    let sql = format!(
        "SELECT DISTINCT ab.blob_id FROM artifact_blobs ab \
         JOIN artifacts a ON a.id = ab.artifact_id \
         WHERE a.repository_id = $1 AND ab.blob_id IN ({})",
        placeholders(2, blob_ids.len())
    );
    let mut query = sqlx::query_scalar::<sqlx::Any, i64>(&sql).bind(id);
    for blob_id in blob_ids {
        query = query.bind(*blob_id);
    }
    Ok(query.fetch_all(conn).await?.into_iter().collect())
}

/// Recompute size (distinct blobs referenced by its artifacts) and tag count.
/// Returns the new size.
pub async fn refresh_counters(conn: &mut AnyConnection, id: i64) -> DalResult<i64> {
    sqlx::query(
        "UPDATE repositories SET \
           size = (SELECT CAST(COALESCE(SUM(b.size), 0) AS BIGINT) FROM blobs b \
                   WHERE b.id IN (SELECT ab.blob_id FROM artifact_blobs ab \
                                  JOIN artifacts a ON a.id = ab.artifact_id \
                                  WHERE a.repository_id = $1)), \
           tag_count = (SELECT COUNT(*) FROM tags t WHERE t.repository_id = $1), \
           updated_at = $2 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;
    Ok(get(conn, id).await?.size)
}

/// Write-lock the repository row, see [`super::namespaces::lock`].
pub async fn lock(conn: &mut AnyConnection, id: i64) -> DalResult<Repository> {
    sqlx::query("UPDATE repositories SET updated_at = updated_at WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    get(conn, id).await
}

/// Change the quotas of a repository.
pub async fn update_limits(
    conn: &mut AnyConnection,
    id: i64,
    size_limit: i64,
    tag_limit: i64,
) -> DalResult<()> {
    let result = sqlx::query(
        "UPDATE repositories SET size_limit = $2, tag_limit = $3, updated_at = $4 WHERE id = $1",
    )
    .bind(id)
    .bind(size_limit)
    .bind(tag_limit)
    .bind(now_ms())
    .execute(conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DalError::NotFound(format!("repository {id}")));
    }
    Ok(())
}

/// Delete a repository with its artifacts and tags.
pub async fn delete(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query("DELETE FROM repositories WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::{namespaces, testing};

    #[tokio::test]
    async fn created_once_and_listed_as_empty() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();
        let ns = namespaces::get_or_create(&mut conn, "library", Visibility::Private)
            .await
            .unwrap();

        let (repo, created) = get_or_create(&mut conn, &ns, "library/app", Visibility::Private)
            .await
            .unwrap();
        assert!(created);
        let (again, created) = get_or_create(&mut conn, &ns, "library/app", Visibility::Private)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, repo.id);

        assert_eq!(count_in_namespace(&mut conn, ns.id).await.unwrap(), 1);
        assert!(is_empty(&mut conn, repo.id).await.unwrap());
        let empty = list_empty_after(&mut conn, Some(ns.id), 0, 10).await.unwrap();
        assert_eq!(empty.len(), 1);
        assert_eq!(refresh_counters(&mut conn, repo.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn referenced_blobs_are_scoped_to_the_repository() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();
        let (repo, blob_id) = crate::dal::artifacts::fixtures::repo(&mut conn).await;
        let (artifact, _) = crate::dal::artifacts::upsert(
            &mut conn,
            &crate::dal::artifacts::fixtures::new(repo.id, "sha256:m1", None),
        )
        .await
        .unwrap();
        crate::dal::artifacts::link_blobs(&mut conn, artifact.id, &[blob_id])
            .await
            .unwrap();

        let ns = namespaces::get(&mut conn, repo.namespace_id).await.unwrap();
        let (other, _) = get_or_create(&mut conn, &ns, "library/other", Visibility::Private)
            .await
            .unwrap();

        let seen = referenced_blob_ids(&mut conn, repo.id, &[blob_id, 999]).await.unwrap();
        assert_eq!(seen, HashSet::from([blob_id]));
        assert!(referenced_blob_ids(&mut conn, other.id, &[blob_id]).await.unwrap().is_empty());
        assert_eq!(refresh_counters(&mut conn, repo.id).await.unwrap(), 4);
    }
}
