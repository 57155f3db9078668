//! Persisted jobs for the database-backed work queue.
//!
//! A row moves `pending -> doing -> success | failed`, or back to `pending`
//! for a retry. Every transition rewrites `version`, and claims are
//! conditional on the version read, so two consumers can never both move
//! the same row to `doing`.

use sqlx::AnyConnection;

use super::{DalError, DalResult, now_ms};

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for a consumer.
    Pending,
    /// Claimed by a consumer.
    Doing,
    /// Handled.
    Success,
    /// Out of retries.
    Failed,
}

impl JobStatus {
    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Doing => "doing",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

/// A job row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub topic: String,
    pub payload: Vec<u8>,
    pub version: String,
    pub times: i64,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

const COLUMNS: &str = "id, topic, payload, version, times, status, created_at, updated_at";

fn new_version() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Enqueue a job. Inside a transaction the job exists iff the transaction
/// commits.
pub async fn insert(conn: &mut AnyConnection, topic: &str, payload: &[u8], times: i64) -> DalResult<i64> {
    let now = now_ms();
    Ok(sqlx::query_scalar(
        "INSERT INTO work_queues (topic, payload, version, times, status, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $6) RETURNING id",
    )
    .bind(topic)
    .bind(payload)
    .bind(new_version())
    .bind(times)
    .bind(JobStatus::Pending.as_str())
    .bind(now)
    .fetch_one(conn)
    .await?)
}

/// Look a job up by id.
pub async fn get(conn: &mut AnyConnection, id: i64) -> DalResult<Job> {
    sqlx::query_as(&format!("SELECT {COLUMNS} FROM work_queues WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("job {id}")))
}

/// Up to `limit` pending jobs of a topic, oldest first.
pub async fn pending(conn: &mut AnyConnection, topic: &str, limit: i64) -> DalResult<Vec<Job>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM work_queues WHERE topic = $1 AND status = $2 ORDER BY id LIMIT $3"
    ))
    .bind(topic)
    .bind(JobStatus::Pending.as_str())
    .bind(limit)
    .fetch_all(conn)
    .await?)
}

/// Move a pending job to `doing` if its version is still `version`.
/// Returns the new version, or `None` if someone else got there first.
pub async fn claim(conn: &mut AnyConnection, id: i64, version: &str) -> DalResult<Option<String>> {
    let next = new_version();
    let result = sqlx::query(
        "UPDATE work_queues SET version = $3, status = $4, updated_at = $5 \
         WHERE id = $1 AND version = $2 AND status = $6",
    )
    .bind(id)
    .bind(version)
    .bind(&next)
    .bind(JobStatus::Doing.as_str())
    .bind(now_ms())
    .bind(JobStatus::Pending.as_str())
    .execute(conn)
    .await?;
    Ok((result.rows_affected() == 1).then_some(next))
}

/// Record the outcome of a claimed job. Returns `false` if the claim was
/// lost (the row was recovered and handed to someone else).
pub async fn finish(
    conn: &mut AnyConnection,
    id: i64,
    version: &str,
    status: JobStatus,
    times: i64,
) -> DalResult<bool> {
    let result = sqlx::query(
        "UPDATE work_queues SET version = $3, status = $4, times = $5, updated_at = $6 \
         WHERE id = $1 AND version = $2",
    )
    .bind(id)
    .bind(version)
    .bind(new_version())
    .bind(status.as_str())
    .bind(times)
    .bind(now_ms())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Return jobs stuck in `doing` since before `before` to `pending`.
pub async fn recover_stale(conn: &mut AnyConnection, topic: &str, before: i64) -> DalResult<u64> {
    let stale: Vec<(i64, String)> = sqlx::query_as(
        "SELECT id, version FROM work_queues WHERE topic = $1 AND status = $2 AND updated_at < $3",
    )
    .bind(topic)
    .bind(JobStatus::Doing.as_str())
    .bind(before)
    .fetch_all(&mut *conn)
    .await?;

    let mut recovered = 0;
    for (id, version) in stale {
        let result = sqlx::query(
            "UPDATE work_queues SET version = $3, status = $4, updated_at = $5 \
             WHERE id = $1 AND version = $2",
        )
        .bind(id)
        .bind(&version)
        .bind(new_version())
        .bind(JobStatus::Pending.as_str())
        .bind(now_ms())
        .execute(&mut *conn)
        .await?;
        recovered += result.rows_affected();
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::testing;

    #[tokio::test]
    async fn only_one_claim_wins() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();

        let id = insert(&mut conn, "gc_blob", b"{}", 0).await.unwrap();
        let job = pending(&mut conn, "gc_blob", 10).await.unwrap().remove(0);
        assert_eq!(job.id, id);

        let first = claim(&mut conn, id, &job.version).await.unwrap();
        let second = claim(&mut conn, id, &job.version).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(pending(&mut conn, "gc_blob", 10).await.unwrap().is_empty());

        let version = first.unwrap();
        assert!(finish(&mut conn, id, &version, JobStatus::Success, 1).await.unwrap());
        assert!(!finish(&mut conn, id, &version, JobStatus::Failed, 2).await.unwrap());
        assert_eq!(get(&mut conn, id).await.unwrap().status, "success");
    }

    #[tokio::test]
    async fn stale_doing_rows_return_to_pending() {
        let dal = testing::dal().await;
        let mut conn = dal.acquire().await.unwrap();

        let id = insert(&mut conn, "webhook", b"{}", 0).await.unwrap();
        let job = get(&mut conn, id).await.unwrap();
        let version = claim(&mut conn, id, &job.version).await.unwrap().unwrap();

        assert_eq!(recover_stale(&mut conn, "webhook", 0).await.unwrap(), 0);
        assert_eq!(
            recover_stale(&mut conn, "webhook", now_ms() + 1).await.unwrap(),
            1
        );
        // the original claimant can no longer finish it
        assert!(!finish(&mut conn, id, &version, JobStatus::Success, 1).await.unwrap());
        assert_eq!(pending(&mut conn, "webhook", 10).await.unwrap().len(), 1);
    }
}
