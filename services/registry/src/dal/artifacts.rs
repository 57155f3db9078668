//! Artifacts: committed manifests and the graph around them.
//!
//! Three relations hang off an artifact: the blobs it references
//! (`artifact_blobs`), the child manifests of an index
//! (`artifact_artifacts`), and `referrer_id`, which points a referrer at its
//! subject.

use serde::Serialize;
use sqlx::AnyConnection;

use super::{DalError, DalResult, now_ms, placeholders};

/// An artifact row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Artifact {
    pub id: i64,
    pub repository_id: i64,
    pub digest: String,
    pub size: i64,
    pub blobs_size: i64,
    pub content_type: String,
    #[serde(skip)]
    pub raw: Vec<u8>,
    pub artifact_type: String,
    pub declared_type: Option<String>,
    pub config_media_type: Option<String>,
    pub subject_digest: Option<String>,
    pub referrer_id: Option<i64>,
    pub pushed_at: i64,
    pub last_pull: i64,
    pub pull_times: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields of a newly pushed manifest.
#[derive(Debug, Clone)]
pub struct NewArtifact<'a> {
    pub repository_id: i64,
    pub digest: &'a str,
    pub blobs_size: i64,
    pub content_type: &'a str,
    pub raw: &'a [u8],
    pub artifact_type: &'a str,
    pub declared_type: Option<&'a str>,
    pub config_media_type: Option<&'a str>,
    pub subject_digest: Option<&'a str>,
}

const COLUMNS: &str = "id, repository_id, digest, size, blobs_size, content_type, raw, \
                       artifact_type, declared_type, config_media_type, subject_digest, \
                       referrer_id, pushed_at, last_pull, pull_times, created_at, updated_at";

/// Insert an artifact unless the repository already has one with this
/// digest. Returns the row and whether it was created.
///
/// A new artifact is linked to its subject if the subject is present, and
/// referrers that arrived before it are linked to it.
pub async fn upsert(
    conn: &mut AnyConnection,
    new: &NewArtifact<'_>,
) -> DalResult<(Artifact, bool)> {
    if let Some(existing) = find_by_digest(&mut *conn, new.repository_id, new.digest).await? {
        return Ok((existing, false));
    }

    let referrer_id = match new.subject_digest {
        Some(subject) => find_by_digest(&mut *conn, new.repository_id, subject)
            .await?
            .map(|subject| subject.id),
        None => None,
    };

    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO artifacts (repository_id, digest, size, blobs_size, content_type, raw, \
         artifact_type, declared_type, config_media_type, subject_digest, referrer_id, \
         pushed_at, last_pull, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12, $12, $12) RETURNING id",
    )
    .bind(new.repository_id)
    .bind(new.digest)
    .bind(new.raw.len() as i64)
    .bind(new.blobs_size)
    .bind(new.content_type)
    .bind(new.raw)
    .bind(new.artifact_type)
    .bind(new.declared_type)
    .bind(new.config_media_type)
    .bind(new.subject_digest)
    .bind(referrer_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(DalError::unique(format!("artifact {}", new.digest)))?;

    sqlx::query(
        "UPDATE artifacts SET referrer_id = $1 \
         WHERE repository_id = $2 AND subject_digest = $3 AND referrer_id IS NULL AND id <> $1",
    )
    .bind(id)
    .bind(new.repository_id)
    .bind(new.digest)
    .execute(&mut *conn)
    .await?;

    Ok((get(conn, id).await?, true))
}

/// Look an artifact up by id.
pub async fn get(conn: &mut AnyConnection, id: i64) -> DalResult<Artifact> {
    sqlx::query_as(&format!("SELECT {COLUMNS} FROM artifacts WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("artifact {id}")))
}

/// Look an artifact up by digest within a repository.
pub async fn find_by_digest(
    conn: &mut AnyConnection,
    repository_id: i64,
    digest: &str,
) -> DalResult<Option<Artifact>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM artifacts WHERE repository_id = $1 AND digest = $2"
    ))
    .bind(repository_id)
    .bind(digest)
    .fetch_optional(conn)
    .await?)
}

/// Every artifact of the repository among `digests`.
pub async fn find_many(
    conn: &mut AnyConnection,
    repository_id: i64,
    digests: &[String],
) -> DalResult<Vec<Artifact>> {
    if digests.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {COLUMNS} FROM artifacts WHERE repository_id = $1 AND digest IN ({})",
        placeholders(2, digests.len())
    );
    let mut query = sqlx::query_as::<sqlx::Any, Artifact>(&sql).bind(repository_id);
    for digest in digests {
        query = query.bind(digest);
    }
    Ok(query.fetch_all(conn).await?)
}

/// Associate blobs with an artifact. Existing links are kept.
pub async fn link_blobs(conn: &mut AnyConnection, artifact_id: i64, blob_ids: &[i64]) -> DalResult<()> {
    for blob_id in blob_ids {
        sqlx::query(
            "INSERT INTO artifact_blobs (artifact_id, blob_id) VALUES ($1, $2) \
             ON CONFLICT (artifact_id, blob_id) DO NOTHING",
        )
        .bind(artifact_id)
        .bind(*blob_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Record an index's children.
pub async fn link_children(
    conn: &mut AnyConnection,
    parent_id: i64,
    child_ids: &[i64],
) -> DalResult<()> {
    for child_id in child_ids {
        sqlx::query(
            "INSERT INTO artifact_artifacts (parent_id, child_id) VALUES ($1, $2) \
             ON CONFLICT (parent_id, child_id) DO NOTHING",
        )
        .bind(parent_id)
        .bind(*child_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Ids of the blobs an artifact references.
pub async fn blob_ids(conn: &mut AnyConnection, artifact_id: i64) -> DalResult<Vec<i64>> {
    Ok(
        sqlx::query_scalar("SELECT blob_id FROM artifact_blobs WHERE artifact_id = $1")
            .bind(artifact_id)
            .fetch_all(conn)
            .await?,
    )
}

/// Record a pull.
pub async fn touch_pull(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query("UPDATE artifacts SET last_pull = $2, pull_times = pull_times + 1 WHERE id = $1")
        .bind(id)
        .bind(now_ms())
        .execute(conn)
        .await?;
    Ok(())
}

/// Artifacts whose `subject` is `digest` in the repository, oldest first.
pub async fn referrers(
    conn: &mut AnyConnection,
    repository_id: i64,
    subject_digest: &str,
) -> DalResult<Vec<Artifact>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM artifacts WHERE repository_id = $1 AND subject_digest = $2 \
         ORDER BY id"
    ))
    .bind(repository_id)
    .bind(subject_digest)
    .fetch_all(conn)
    .await?)
}

/// Artifacts linked to `id` as their subject.
pub async fn referrer_ids(conn: &mut AnyConnection, id: i64) -> DalResult<Vec<i64>> {
    Ok(
        sqlx::query_scalar("SELECT id FROM artifacts WHERE referrer_id = $1 ORDER BY id")
            .bind(id)
            .fetch_all(conn)
            .await?,
    )
}

/// Artifacts of a repository not pulled since `before`, one page by id.
pub async fn list_stale_after(
    conn: &mut AnyConnection,
    repository_id: i64,
    before: i64,
    after_id: i64,
    limit: i64,
) -> DalResult<Vec<Artifact>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM artifacts WHERE repository_id = $1 AND last_pull < $2 \
         AND id > $3 ORDER BY id LIMIT $4"
    ))
    .bind(repository_id)
    .bind(before)
    .bind(after_id)
    .bind(limit)
    .fetch_all(conn)
    .await?)
}

/// Whether any tag points at the artifact.
pub async fn is_tagged(conn: &mut AnyConnection, id: i64) -> DalResult<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags WHERE artifact_id = $1")
        .bind(id)
        .fetch_one(conn)
        .await?;
    Ok(count > 0)
}

/// Whether the artifact is a child of some index.
pub async fn has_parent(conn: &mut AnyConnection, id: i64) -> DalResult<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM artifact_artifacts WHERE child_id = $1")
            .bind(id)
            .fetch_one(conn)
            .await?;
    Ok(count > 0)
}

/// Number of artifacts in a repository.
pub async fn count_in_repository(conn: &mut AnyConnection, repository_id: i64) -> DalResult<i64> {
    Ok(
        sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE repository_id = $1")
            .bind(repository_id)
            .fetch_one(conn)
            .await?,
    )
}

/// Delete an artifact. Its blob links, child links and tags go with it;
/// referrers pointing at it are unlinked.
pub async fn delete(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    sqlx::query("DELETE FROM artifacts WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::config::Visibility;
    use crate::dal::{blobs, namespaces, repositories};

    /// A repository `library/app` and the id of a blob it can reference.
    pub async fn repo(conn: &mut AnyConnection) -> (repositories::Repository, i64) {
        let ns = namespaces::get_or_create(conn, "library", Visibility::Private)
            .await
            .unwrap();
        let (repo, _) = repositories::get_or_create(conn, &ns, "library/app", Visibility::Private)
            .await
            .unwrap();
        let blob = blobs::upsert(conn, "sha256:blob", 4, "application/octet-stream")
            .await
            .unwrap();
        (repo, blob.id)
    }

    /// A minimal artifact row.
    pub fn new<'a>(repository_id: i64, digest: &'a str, subject: Option<&'a str>) -> NewArtifact<'a> {
        NewArtifact {
            repository_id,
            digest,
            blobs_size: 4,
            content_type: crate::manifest::OCI_MANIFEST,
            raw: b"{}",
            artifact_type: "image",
            declared_type: None,
            config_media_type: None,
            subject_digest: subject,
        }
    }
}
