//! Namespaces, the top-level tenancy unit.

use serde::Serialize;
use sqlx::AnyConnection;

use super::{DalError, DalResult, now_ms};
use crate::config::Visibility;

/// A namespace row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Namespace {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub visibility: String,
    pub size: i64,
    pub size_limit: i64,
    pub repository_count: i64,
    pub repository_limit: i64,
    pub tag_count: i64,
    pub tag_limit: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Namespace {
    /// Parsed visibility.
    pub fn visibility(&self) -> Visibility {
        Visibility::from_column(&self.visibility)
    }
}

/// Fields for a new namespace. Limits of zero are unlimited.
#[derive(Debug, Clone, Default)]
pub struct NewNamespace<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub visibility: Visibility,
    pub size_limit: i64,
    pub repository_limit: i64,
    pub tag_limit: i64,
}

const COLUMNS: &str = "id, name, description, visibility, size, size_limit, repository_count, \
                       repository_limit, tag_count, tag_limit, created_at, updated_at";

/// Insert a namespace; fails with [`DalError::Conflict`] if the name is taken.
pub async fn create(conn: &mut AnyConnection, new: &NewNamespace<'_>) -> DalResult<Namespace> {
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO namespaces (name, description, visibility, size_limit, repository_limit, \
         tag_limit, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $7) RETURNING id",
    )
    .bind(new.name)
    .bind(new.description)
    .bind(new.visibility.as_str())
    .bind(new.size_limit)
    .bind(new.repository_limit)
    .bind(new.tag_limit)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(DalError::unique(format!("namespace {}", new.name)))?;
    get(conn, id).await
}

/// Look a namespace up by id.
pub async fn get(conn: &mut AnyConnection, id: i64) -> DalResult<Namespace> {
    sqlx::query_as(&format!("SELECT {COLUMNS} FROM namespaces WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("namespace {id}")))
}

/// Look a namespace up by name.
pub async fn find_by_name(conn: &mut AnyConnection, name: &str) -> DalResult<Option<Namespace>> {
    Ok(
        sqlx::query_as(&format!("SELECT {COLUMNS} FROM namespaces WHERE name = $1"))
            .bind(name)
            .fetch_optional(conn)
            .await?,
    )
}

/// The namespace called `name`, created with `visibility` if missing.
pub async fn get_or_create(
    conn: &mut AnyConnection,
    name: &str,
    visibility: crate::config::Visibility,
) -> DalResult<Namespace> {
    let now = now_ms();
    sqlx::query(
        "INSERT INTO namespaces (name, visibility, created_at, updated_at) VALUES ($1, $2, $3, $3) \
         ON CONFLICT (name) DO NOTHING",
    )
    .bind(name)
    .bind(visibility.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await?;
    find_by_name(conn, name)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("namespace {name}")))
}

/// One page of namespaces ordered by id.
pub async fn list_after(
    conn: &mut AnyConnection,
    after_id: i64,
    limit: i64,
) -> DalResult<Vec<Namespace>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM namespaces WHERE id > $1 ORDER BY id LIMIT $2"
    ))
    .bind(after_id)
    .bind(limit)
    .fetch_all(conn)
    .await?)
}

/// Write-lock the namespace row for the rest of the transaction and return
/// it as of now. Quota checks read through this so concurrent pushes into
/// the namespace take turns.
pub async fn lock(conn: &mut AnyConnection, id: i64) -> DalResult<Namespace> {
    sqlx::query("UPDATE namespaces SET updated_at = updated_at WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    get(conn, id).await
}

/// Change the quotas of a namespace.
pub async fn update_limits(
    conn: &mut AnyConnection,
    id: i64,
    size_limit: i64,
    repository_limit: i64,
    tag_limit: i64,
) -> DalResult<()> {
    let result = sqlx::query(
        "UPDATE namespaces SET size_limit = $2, repository_limit = $3, tag_limit = $4, \
         updated_at = $5 WHERE id = $1",
    )
    .bind(id)
    .bind(size_limit)
    .bind(repository_limit)
    .bind(tag_limit)
    .bind(now_ms())
    .execute(conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DalError::NotFound(format!("namespace {id}")));
    }
    Ok(())
}

/// Recompute size and counters from the repositories below the namespace.
pub async fn refresh_counters(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query(
        "UPDATE namespaces SET \
           size = (SELECT CAST(COALESCE(SUM(r.size), 0) AS BIGINT) FROM repositories r \
                   WHERE r.namespace_id = $1), \
           repository_count = (SELECT COUNT(*) FROM repositories r WHERE r.namespace_id = $1), \
           tag_count = (SELECT COUNT(*) FROM tags t JOIN repositories r ON r.id = t.repository_id \
                        WHERE r.namespace_id = $1), \
           updated_at = $2 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(now_ms())
    .execute(conn)
    .await?;
    Ok(())
}

/// Delete a namespace and, through the foreign keys, everything in it.
pub async fn delete(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query("DELETE FROM namespaces WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::testing;

    #[tokio::test]
    async fn names_are_unique() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();

        let ns = create(
            &mut conn,
            &NewNamespace {
                name: "library",
                size_limit: 1024,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(ns.size_limit, 1024);
        assert_eq!(ns.visibility(), Visibility::Private);

        let dup = create(
            &mut conn,
            &NewNamespace {
                name: "library",
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(dup, Err(DalError::Conflict(_))));

        let same = get_or_create(&mut conn, "library", Visibility::Public)
            .await
            .unwrap();
        assert_eq!(same.id, ns.id);
        assert_eq!(list_after(&mut conn, 0, 10).await.unwrap().len(), 1);
    }
}
