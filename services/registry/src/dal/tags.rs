//! Tags: mutable names for artifacts.

use serde::Serialize;
use sqlx::AnyConnection;

use super::{DalError, DalResult, now_ms};

/// A tag row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub repository_id: i64,
    pub artifact_id: i64,
    pub name: String,
    pub pushed_at: i64,
    pub last_pull: i64,
    pub pull_times: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A tag together with the digest it points at.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaggedDigest {
    pub id: i64,
    pub name: String,
    pub digest: String,
    pub pushed_at: i64,
}

const COLUMNS: &str = "id, repository_id, artifact_id, name, pushed_at, last_pull, pull_times, \
                       created_at, updated_at";

/// Point `name` at `artifact_id`, creating the tag if needed. Returns the
/// tag and whether it was created.
pub async fn upsert(
    conn: &mut AnyConnection,
    repository_id: i64,
    artifact_id: i64,
    name: &str,
) -> DalResult<(Tag, bool)> {
    let now = now_ms();
    let created = match find(&mut *conn, repository_id, name).await? {
        Some(existing) => {
            sqlx::query(
                "UPDATE tags SET artifact_id = $2, pushed_at = $3, updated_at = $3 WHERE id = $1",
            )
            .bind(existing.id)
            .bind(artifact_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            false
        }
        None => {
            sqlx::query(
                "INSERT INTO tags (repository_id, artifact_id, name, pushed_at, last_pull, \
                 created_at, updated_at) VALUES ($1, $2, $3, $4, $4, $4, $4)",
            )
            .bind(repository_id)
            .bind(artifact_id)
            .bind(name)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(DalError::unique(format!("tag {name}")))?;
            true
        }
    };
    let tag = find(conn, repository_id, name)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("tag {name}")))?;
    Ok((tag, created))
}

/// Look a tag up by name.
pub async fn find(
    conn: &mut AnyConnection,
    repository_id: i64,
    name: &str,
) -> DalResult<Option<Tag>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM tags WHERE repository_id = $1 AND name = $2"
    ))
    .bind(repository_id)
    .bind(name)
    .fetch_optional(conn)
    .await?)
}

/// Tag names in lexical order, starting after `last`.
pub async fn list_names(
    conn: &mut AnyConnection,
    repository_id: i64,
    last: Option<&str>,
    limit: i64,
) -> DalResult<Vec<String>> {
    let rows = match last {
        Some(last) => {
            sqlx::query_scalar(
                "SELECT name FROM tags WHERE repository_id = $1 AND name > $2 \
                 ORDER BY name LIMIT $3",
            )
            .bind(repository_id)
            .bind(last)
            .bind(limit)
            .fetch_all(conn)
            .await?
        }
        None => {
            sqlx::query_scalar(
                "SELECT name FROM tags WHERE repository_id = $1 ORDER BY name LIMIT $2",
            )
            .bind(repository_id)
            .bind(limit)
            .fetch_all(conn)
            .await?
        }
    };
    Ok(rows)
}

/// Every tag of a repository with its digest, newest push first.
pub async fn list_with_digests(
    conn: &mut AnyConnection,
    repository_id: i64,
) -> DalResult<Vec<TaggedDigest>> {
    Ok(sqlx::query_as(
        "SELECT t.id, t.name, a.digest, t.pushed_at FROM tags t \
         JOIN artifacts a ON a.id = t.artifact_id \
         WHERE t.repository_id = $1 ORDER BY t.pushed_at DESC, t.id DESC",
    )
    .bind(repository_id)
    .fetch_all(conn)
    .await?)
}

/// Number of tags in a repository.
pub async fn count_in_repository(conn: &mut AnyConnection, repository_id: i64) -> DalResult<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE repository_id = $1")
            .bind(repository_id)
            .fetch_one(conn)
            .await?,
    )
}

/// Number of tags across a namespace.
pub async fn count_in_namespace(conn: &mut AnyConnection, namespace_id: i64) -> DalResult<i64> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM tags t JOIN repositories r ON r.id = t.repository_id \
         WHERE r.namespace_id = $1",
    )
    .bind(namespace_id)
    .fetch_one(conn)
    .await?)
}

/// Record a pull.
pub async fn touch_pull(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query("UPDATE tags SET last_pull = $2, pull_times = pull_times + 1 WHERE id = $1")
        .bind(id)
        .bind(now_ms())
        .execute(conn)
        .await?;
    Ok(())
}

/// Delete one tag. The artifact stays.
pub async fn delete(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query("DELETE FROM tags WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Delete every tag pointing at an artifact, returning their names.
pub async fn delete_by_artifact(conn: &mut AnyConnection, artifact_id: i64) -> DalResult<Vec<String>> {
    let names: Vec<String> =
        sqlx::query_scalar("SELECT name FROM tags WHERE artifact_id = $1 ORDER BY name")
            .bind(artifact_id)
            .fetch_all(&mut *conn)
            .await?;
    sqlx::query("DELETE FROM tags WHERE artifact_id = $1")
        .bind(artifact_id)
        .execute(conn)
        .await?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::artifacts::{self, fixtures};
    use crate::dal::testing;

    #[tokio::test]
    async fn retag_moves_and_lists_in_order() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();
        let (repo, _) = fixtures::repo(&mut conn).await;
        let (a, _) = artifacts::upsert(&mut conn, &fixtures::new(repo.id, "sha256:a", None))
            .await
            .unwrap();
        let (b, _) = artifacts::upsert(&mut conn, &fixtures::new(repo.id, "sha256:b", None))
            .await
            .unwrap();

        for name in ["v2", "latest", "v1"] {
            upsert(&mut conn, repo.id, a.id, name).await.unwrap();
        }
        let (moved, created) = upsert(&mut conn, repo.id, b.id, "latest").await.unwrap();
        assert!(!created);
        assert_eq!(moved.artifact_id, b.id);

        assert_eq!(
            list_names(&mut conn, repo.id, None, 2).await.unwrap(),
            vec!["latest", "v1"]
        );
        assert_eq!(
            list_names(&mut conn, repo.id, Some("v1"), 10).await.unwrap(),
            vec!["v2"]
        );
        assert_eq!(count_in_repository(&mut conn, repo.id).await.unwrap(), 3);
        assert_eq!(count_in_namespace(&mut conn, repo.namespace_id).await.unwrap(), 3);

        let removed = delete_by_artifact(&mut conn, a.id).await.unwrap();
        assert_eq!(removed, vec!["v1", "v2"]);
        assert_eq!(list_with_digests(&mut conn, repo.id).await.unwrap()[0].digest, "sha256:b");
    }
}
