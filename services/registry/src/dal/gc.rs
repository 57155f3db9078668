//! Garbage collection runners, their audit records, and tag retention rules.

use serde::Serialize;
use sqlx::AnyConnection;

use super::{DalError, DalResult, now_ms};

/// What a runner collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// Tags past their retention rules.
    Tag,
    /// Unreferenced artifacts.
    Artifact,
    /// Unreferenced blobs and stale uploads.
    Blob,
    /// Empty repositories.
    Repository,
}

impl Resource {
    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Tag => "tag",
            Resource::Artifact => "artifact",
            Resource::Blob => "blob",
            Resource::Repository => "repository",
        }
    }

    /// Parse a stored column value.
    pub fn from_column(value: &str) -> DalResult<Self> {
        match value {
            "tag" => Ok(Resource::Tag),
            "artifact" => Ok(Resource::Artifact),
            "blob" => Ok(Resource::Blob),
            "repository" => Ok(Resource::Repository),
            other => Err(DalError::Corrupt(format!("gc resource {other}"))),
        }
    }

    /// The phase that follows this one in a cascading run.
    pub fn next(&self) -> Option<Self> {
        match self {
            Resource::Tag => Some(Resource::Artifact),
            Resource::Artifact => Some(Resource::Blob),
            Resource::Blob => Some(Resource::Repository),
            Resource::Repository => None,
        }
    }

    fn records(&self) -> &'static str {
        match self {
            Resource::Tag => "gc_tag_records",
            Resource::Artifact => "gc_artifact_records",
            Resource::Blob => "gc_blob_records",
            Resource::Repository => "gc_repository_records",
        }
    }
}

/// Runner and record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not started.
    Pending,
    /// Running.
    Doing,
    /// Finished.
    Success,
    /// Finished with an error.
    Failed,
}

impl RunStatus {
    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Doing => "doing",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// A GC runner row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Runner {
    pub id: i64,
    pub resource: String,
    pub namespace_id: Option<i64>,
    pub status: String,
    pub operate_type: String,
    pub cascade_next: i64,
    pub message: Option<String>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub success_count: i64,
    pub failed_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Runner {
    /// Parsed resource.
    pub fn resource(&self) -> DalResult<Resource> {
        Resource::from_column(&self.resource)
    }

    /// Whether the next phase is queued when this one succeeds.
    pub fn cascades(&self) -> bool {
        self.cascade_next != 0
    }
}

/// An audit record of one deletion.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Record {
    pub id: i64,
    pub runner_id: i64,
    /// Tag, repository name, or digest depending on the table.
    pub subject: String,
    pub digest: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub created_at: i64,
}

/// How a retention rule keeps tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Keep tags pushed within the last `amount` days.
    Day,
    /// Keep the newest `amount` tags.
    Quantity,
}

impl RuleKind {
    fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Day => "day",
            RuleKind::Quantity => "quantity",
        }
    }
}

/// A tag retention rule. Rules without a namespace apply everywhere.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RetentionRule {
    pub id: i64,
    pub namespace_id: Option<i64>,
    pub kind: String,
    pub amount: i64,
    /// Only tags matching this regex are considered.
    pub pattern: Option<String>,
    pub created_at: i64,
}

impl RetentionRule {
    /// Parsed kind.
    pub fn kind(&self) -> DalResult<RuleKind> {
        match self.kind.as_str() {
            "day" => Ok(RuleKind::Day),
            "quantity" => Ok(RuleKind::Quantity),
            other => Err(DalError::Corrupt(format!("retention rule kind {other}"))),
        }
    }
}

const RUNNER_COLUMNS: &str = "id, resource, namespace_id, status, operate_type, cascade_next, \
                              message, started_at, ended_at, duration_ms, success_count, \
                              failed_count, created_at, updated_at";

/// Create a pending runner.
pub async fn create_runner(
    conn: &mut AnyConnection,
    resource: Resource,
    namespace_id: Option<i64>,
    cascade: bool,
    operate_type: &str,
) -> DalResult<Runner> {
    let now = now_ms();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO gc_runners (resource, namespace_id, status, operate_type, cascade_next, \
         created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $6) RETURNING id",
    )
    .bind(resource.as_str())
    .bind(namespace_id)
    .bind(RunStatus::Pending.as_str())
    .bind(operate_type)
    .bind(i64::from(cascade))
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    get_runner(conn, id).await
}

/// Look a runner up by id.
pub async fn get_runner(conn: &mut AnyConnection, id: i64) -> DalResult<Runner> {
    sqlx::query_as(&format!("SELECT {RUNNER_COLUMNS} FROM gc_runners WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("gc runner {id}")))
}

/// Mark a runner as started.
pub async fn start_runner(conn: &mut AnyConnection, id: i64) -> DalResult<()> {
    let now = now_ms();
    sqlx::query("UPDATE gc_runners SET status = $2, started_at = $3, updated_at = $3 WHERE id = $1")
        .bind(id)
        .bind(RunStatus::Doing.as_str())
        .bind(now)
        .execute(conn)
        .await?;
    Ok(())
}

/// Record the end of a run.
pub async fn finish_runner(
    conn: &mut AnyConnection,
    id: i64,
    status: RunStatus,
    success_count: i64,
    failed_count: i64,
    message: Option<&str>,
) -> DalResult<()> {
    let now = now_ms();
    sqlx::query(
        "UPDATE gc_runners SET status = $2, success_count = $3, failed_count = $4, message = $5, \
         ended_at = $6, duration_ms = $6 - COALESCE(started_at, $6), updated_at = $6 \
         WHERE id = $1",
    )
    .bind(id)
    .bind(status.as_str())
    .bind(success_count)
    .bind(failed_count)
    .bind(message)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Add an audit record for `resource` to a run.
pub async fn insert_record(
    conn: &mut AnyConnection,
    resource: Resource,
    runner_id: i64,
    subject: &str,
    digest: Option<&str>,
    status: RunStatus,
    message: Option<&str>,
) -> DalResult<()> {
    sqlx::query(&format!(
        "INSERT INTO {} (runner_id, subject, digest, status, message, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
        resource.records()
    ))
    .bind(runner_id)
    .bind(subject)
    .bind(digest)
    .bind(status.as_str())
    .bind(message)
    .bind(now_ms())
    .execute(conn)
    .await?;
    Ok(())
}

/// Audit records of a run.
pub async fn list_records(
    conn: &mut AnyConnection,
    resource: Resource,
    runner_id: i64,
) -> DalResult<Vec<Record>> {
    Ok(sqlx::query_as(&format!(
        "SELECT id, runner_id, subject, digest, status, message, created_at FROM {} \
         WHERE runner_id = $1 ORDER BY id",
        resource.records()
    ))
    .bind(runner_id)
    .fetch_all(conn)
    .await?)
}

/// Add a retention rule.
pub async fn create_rule(
    conn: &mut AnyConnection,
    namespace_id: Option<i64>,
    kind: RuleKind,
    amount: i64,
    pattern: Option<&str>,
) -> DalResult<i64> {
    Ok(sqlx::query_scalar(
        "INSERT INTO tag_retention_rules (namespace_id, kind, amount, pattern, created_at) \
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(namespace_id)
    .bind(kind.as_str())
    .bind(amount)
    .bind(pattern)
    .bind(now_ms())
    .fetch_one(conn)
    .await?)
}

/// Rules that apply inside a namespace: its own and the global ones.
pub async fn rules_for(conn: &mut AnyConnection, namespace_id: i64) -> DalResult<Vec<RetentionRule>> {
    Ok(sqlx::query_as(
        "SELECT id, namespace_id, kind, amount, pattern, created_at FROM tag_retention_rules \
         WHERE namespace_id = $1 OR namespace_id IS NULL ORDER BY id",
    )
    .bind(namespace_id)
    .fetch_all(conn)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::testing;

    #[tokio::test]
    async fn runner_lifecycle() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();

        let runner = create_runner(&mut conn, Resource::Blob, None, true, "manual")
            .await
            .unwrap();
        assert_eq!(runner.resource().unwrap(), Resource::Blob);
        assert!(runner.cascades());

        start_runner(&mut conn, runner.id).await.unwrap();
        insert_record(
            &mut conn,
            Resource::Blob,
            runner.id,
            "sha256:aa",
            Some("sha256:aa"),
            RunStatus::Success,
            None,
        )
        .await
        .unwrap();
        finish_runner(&mut conn, runner.id, RunStatus::Success, 1, 0, None)
            .await
            .unwrap();

        let runner = get_runner(&mut conn, runner.id).await.unwrap();
        assert_eq!(runner.status, "success");
        assert_eq!(runner.success_count, 1);
        assert!(runner.duration_ms.is_some());
        assert_eq!(
            list_records(&mut conn, Resource::Blob, runner.id).await.unwrap().len(),
            1
        );
        assert!(list_records(&mut conn, Resource::Tag, runner.id).await.unwrap().is_empty());
    }

    #[test]
    fn phases_cascade_in_order() {
        assert_eq!(Resource::Tag.next(), Some(Resource::Artifact));
        assert_eq!(Resource::Artifact.next(), Some(Resource::Blob));
        assert_eq!(Resource::Blob.next(), Some(Resource::Repository));
        assert_eq!(Resource::Repository.next(), None);
    }
}
