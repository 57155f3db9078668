//! Resumable blob upload sessions.

use sqlx::AnyConnection;

use super::{DalError, DalResult, now_ms};

/// Session accepting chunks.
pub const OPEN: &str = "open";
/// Session turned into a blob.
pub const COMMITTED: &str = "committed";
/// Session cancelled by the client or reaped as stale.
pub const ABORTED: &str = "aborted";

/// An upload row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Upload {
    pub id: i64,
    /// Opaque id handed to the client.
    pub upload_id: String,
    pub repository: String,
    /// Multipart handle issued by the storage driver.
    pub driver_upload_id: String,
    /// Bytes received so far, held back tail included.
    pub size: i64,
    /// Trailing bytes too short to be sent as a part yet.
    pub tail: Option<Vec<u8>>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One received chunk.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UploadPart {
    pub part_number: i64,
    pub etag: String,
    pub range_start: i64,
    pub range_end: i64,
}

const COLUMNS: &str =
    "id, upload_id, repository, driver_upload_id, size, tail, status, created_at, updated_at";

/// Open a session.
pub async fn create(
    conn: &mut AnyConnection,
    upload_id: &str,
    repository: &str,
    driver_upload_id: &str,
) -> DalResult<Upload> {
    let now = now_ms();
    sqlx::query(
        "INSERT INTO blob_uploads (upload_id, repository, driver_upload_id, status, created_at, \
         updated_at) VALUES ($1, $2, $3, $4, $5, $5)",
    )
    .bind(upload_id)
    .bind(repository)
    .bind(driver_upload_id)
    .bind(OPEN)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(DalError::unique(format!("upload {upload_id}")))?;
    find_open(conn, upload_id)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("upload {upload_id}")))
}

/// An open session by client id.
pub async fn find_open(conn: &mut AnyConnection, upload_id: &str) -> DalResult<Option<Upload>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM blob_uploads WHERE upload_id = $1 AND status = $2"
    ))
    .bind(upload_id)
    .bind(OPEN)
    .fetch_optional(conn)
    .await?)
}

/// Record a chunk covering `start..=end`, provided nothing else was
/// appended since the caller read `upload.size`. The chunk absorbs any held
/// back tail. Returns `false` on a lost race.
pub async fn append_part(
    conn: &mut AnyConnection,
    upload: &Upload,
    part_number: i64,
    etag: &str,
    start: i64,
    end: i64,
) -> DalResult<bool> {
    let advanced = sqlx::query(
        "UPDATE blob_uploads SET size = $3, tail = NULL, updated_at = $4 \
         WHERE id = $1 AND size = $2 AND status = $5",
    )
    .bind(upload.id)
    .bind(upload.size)
    .bind(end + 1)
    .bind(now_ms())
    .bind(OPEN)
    .execute(&mut *conn)
    .await?;
    if advanced.rows_affected() != 1 {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO blob_upload_parts (upload_id, part_number, etag, range_start, range_end) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(upload.id)
    .bind(part_number)
    .bind(etag)
    .bind(start)
    .bind(end)
    .execute(conn)
    .await
    .map_err(DalError::unique(format!("part {part_number}")))?;
    Ok(true)
}

/// Hold `tail` back until more bytes arrive, growing the session to `size`.
/// Same race rule as [`append_part`].
pub async fn stash_tail(
    conn: &mut AnyConnection,
    upload: &Upload,
    size: i64,
    tail: &[u8],
) -> DalResult<bool> {
    let result = sqlx::query(
        "UPDATE blob_uploads SET size = $3, tail = $4, updated_at = $5 \
         WHERE id = $1 AND size = $2 AND status = $6",
    )
    .bind(upload.id)
    .bind(upload.size)
    .bind(size)
    .bind(tail)
    .bind(now_ms())
    .bind(OPEN)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Bytes held by open sessions of `repository`, other than `except`.
pub async fn open_size_in_repository(
    conn: &mut AnyConnection,
    repository: &str,
    except: i64,
) -> DalResult<i64> {
    Ok(sqlx::query_scalar(
        "SELECT CAST(COALESCE(SUM(size), 0) AS BIGINT) FROM blob_uploads \
         WHERE repository = $1 AND status = $2 AND id <> $3",
    )
    .bind(repository)
    .bind(OPEN)
    .bind(except)
    .fetch_one(conn)
    .await?)
}

/// Bytes held by open sessions of every repository under `namespace`, other
/// than `except`.
pub async fn open_size_in_namespace(
    conn: &mut AnyConnection,
    namespace: &str,
    except: i64,
) -> DalResult<i64> {
    Ok(sqlx::query_scalar(
        "SELECT CAST(COALESCE(SUM(size), 0) AS BIGINT) FROM blob_uploads \
         WHERE repository LIKE $1 ESCAPE '\\' AND status = $2 AND id <> $3",
    )
    .bind(format!("{}/%", escape_like(namespace)))
    .bind(OPEN)
    .bind(except)
    .fetch_one(conn)
    .await?)
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Received chunks in order.
pub async fn parts(conn: &mut AnyConnection, id: i64) -> DalResult<Vec<UploadPart>> {
    Ok(sqlx::query_as(
        "SELECT part_number, etag, range_start, range_end FROM blob_upload_parts \
         WHERE upload_id = $1 ORDER BY part_number",
    )
    .bind(id)
    .fetch_all(conn)
    .await?)
}

/// Move an open session to `status`. Returns `false` if it was no longer open.
pub async fn finish(conn: &mut AnyConnection, id: i64, status: &str) -> DalResult<bool> {
    let result = sqlx::query(
        "UPDATE blob_uploads SET status = $2, updated_at = $3 WHERE id = $1 AND status = $4",
    )
    .bind(id)
    .bind(status)
    .bind(now_ms())
    .bind(OPEN)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Open sessions idle since before `before`.
pub async fn list_stale(conn: &mut AnyConnection, before: i64, limit: i64) -> DalResult<Vec<Upload>> {
    Ok(sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM blob_uploads WHERE status = $1 AND updated_at < $2 \
         ORDER BY id LIMIT $3"
    ))
    .bind(OPEN)
    .bind(before)
    .bind(limit)
    .fetch_all(conn)
    .await?)
}
