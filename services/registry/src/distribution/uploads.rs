//! Resumable blob uploads.
//!
//! A session maps onto a multipart upload of the storage driver at
//! `blob_uploads/<id>`. Every PATCH appends its body as one or more parts;
//! the PUT appends the last bytes, assembles the object, checks its digest
//! and moves it to the blob's canonical path.
//!
//! Drivers with a minimum part size get every part but the last at that
//! size: a shorter remainder is kept on the session row and prefixed to the
//! next chunk.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use sqlx::AnyConnection;
use storage::{Part, paths};

use super::{Action, CONTENT_DIGEST, Request, UPLOAD_UUID};
use crate::app::App;
use crate::dal::uploads::{self, Upload};
use crate::dal::{blobs, namespaces, repositories};
use crate::digest::{Digest, Digester};
use crate::error::{RegistryError, RegistryResult};
use crate::quota;

/// Bytes buffered before they are sent to the driver as one part.
const PART_SIZE: usize = 8 * 1024 * 1024;

fn location(name: &str, upload_id: &str) -> String {
    format!("/v2/{name}/blobs/uploads/{upload_id}")
}

/// `Range` value for a session holding `size` bytes.
fn range(size: i64) -> String {
    format!("0-{}", (size - 1).max(0))
}

fn session_headers(name: &str, upload: &Upload) -> [(header::HeaderName, String); 3] {
    [
        (header::LOCATION, location(name, &upload.upload_id)),
        (header::RANGE, range(upload.size)),
        (UPLOAD_UUID, upload.upload_id.clone()),
    ]
}

/// `POST /v2/<name>/blobs/uploads/`
///
/// Opens a session, or with `?mount=<digest>&from=<repository>` links a blob
/// `from` already references, or with `?digest=<digest>` takes the whole blob
/// in the request body. A mount that cannot be served opens a session.
pub(super) async fn start(request: Request, body: Body) -> RegistryResult<Response> {
    request.authorize(Action::Push).await?;
    let app = &request.app;

    if let (Some(mount), Some(from)) = (request.params.get("mount"), request.params.get("from")) {
        let digest: Digest = mount.parse()?;
        super::access::authorize(app, &request.caller, from, Action::Pull).await?;
        if mountable(app, from, &digest).await? {
            tracing::debug!(%digest, from, "mounted existing blob");
            return Ok(committed(&request.name, &digest));
        }
    }

    let mut upload = open(app, &request.name).await?;

    if let Some(digest) = request.params.get("digest") {
        let digest: Digest = digest.parse()?;
        return finish(&request, &mut upload, &digest, body).await;
    }

    Ok((
        StatusCode::ACCEPTED,
        session_headers(&request.name, &upload),
    )
        .into_response())
}

/// Whether some artifact of repository `from` references the blob.
async fn mountable(app: &App, from: &str, digest: &Digest) -> RegistryResult<bool> {
    let mut conn = app.dal().acquire().await?;
    let Some(repo) = repositories::find_by_name(&mut conn, from).await? else {
        return Ok(false);
    };
    let Some(blob) = blobs::find_by_digest(&mut conn, &digest.to_string()).await? else {
        return Ok(false);
    };
    let referenced = repositories::referenced_blob_ids(&mut conn, repo.id, &[blob.id]).await?;
    Ok(referenced.contains(&blob.id))
}

async fn open(app: &App, name: &str) -> RegistryResult<Upload> {
    let upload_id = uuid::Uuid::new_v4().to_string();
    let driver_upload_id = app
        .storage()
        .create_upload_id(&paths::upload(&upload_id))
        .await?;
    let mut conn = app.dal().acquire().await?;
    let upload = uploads::create(&mut conn, &upload_id, name, &driver_upload_id).await?;
    tracing::debug!(upload_id, repository = name, "upload opened");
    Ok(upload)
}

/// The open session `upload_id` of the request's repository.
async fn session(request: &Request, upload_id: &str) -> RegistryResult<Upload> {
    let mut conn = request.app.dal().acquire().await?;
    uploads::find_open(&mut conn, upload_id)
        .await?
        .filter(|upload| upload.repository == request.name)
        .ok_or_else(|| RegistryError::BlobUploadUnknown(upload_id.to_owned()))
}

/// `GET <location>`: progress of a session.
pub(super) async fn status(request: Request, upload_id: &str) -> RegistryResult<Response> {
    request.authorize(Action::Push).await?;
    let upload = session(&request, upload_id).await?;
    Ok((
        StatusCode::NO_CONTENT,
        session_headers(&request.name, &upload),
    )
        .into_response())
}

/// `PATCH <location>`: append a chunk.
pub(super) async fn patch(request: Request, upload_id: &str, body: Body) -> RegistryResult<Response> {
    request.authorize(Action::Push).await?;
    let mut upload = session(&request, upload_id).await?;

    let mut expected = None;
    if let Some((start, end)) = content_range(&request.headers)? {
        if start != upload.size {
            return Err(RegistryError::RangeInvalid(format!(
                "chunk starts at {start}, upload holds {} bytes",
                upload.size
            )));
        }
        let length = end - start + 1;
        if let Some(declared) = content_length(&request.headers).filter(|&declared| declared != length) {
            return Err(length_mismatch(length, declared));
        }
        expected = Some(length);
    }

    append(&request.app, &mut upload, body, expected, false).await?;
    Ok((
        StatusCode::ACCEPTED,
        session_headers(&request.name, &upload),
    )
        .into_response())
}

/// `PUT <location>?digest=<digest>`: append the body and commit.
pub(super) async fn complete(
    request: Request,
    upload_id: &str,
    body: Body,
) -> RegistryResult<Response> {
    request.authorize(Action::Push).await?;
    let digest: Digest = request
        .params
        .get("digest")
        .ok_or_else(|| RegistryError::DigestInvalid("digest parameter is required".into()))?
        .parse()?;
    let mut upload = session(&request, upload_id).await?;
    finish(&request, &mut upload, &digest, body).await
}

/// `DELETE <location>`: abandon a session.
pub(super) async fn cancel(request: Request, upload_id: &str) -> RegistryResult<Response> {
    request.authorize(Action::Push).await?;
    let upload = session(&request, upload_id).await?;
    let app = &request.app;
    let path = paths::upload(&upload.upload_id);

    app.storage()
        .abort_upload(&path, &upload.driver_upload_id)
        .await?;
    if let Err(error) = app.storage().delete(&path).await {
        tracing::warn!(%error, upload_id, "could not remove aborted upload");
    }
    let mut conn = app.dal().acquire().await?;
    if !uploads::finish(&mut conn, upload.id, uploads::ABORTED).await? {
        return Err(RegistryError::BlobUploadUnknown(upload_id.to_owned()));
    }
    tracing::debug!(upload_id, "upload cancelled");
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// First and last offset of a `Content-Range: <start>-<end>` header, if sent.
fn content_range(headers: &HeaderMap) -> RegistryResult<Option<(i64, i64)>> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let invalid = || RegistryError::RangeInvalid("malformed Content-Range".into());
    let value = value.to_str().map_err(|_| invalid())?;
    let value = value.trim().trim_start_matches("bytes").trim_start_matches([' ', '=']);
    let span = value.split('/').next().unwrap_or(value);
    let (start, end) = span.split_once('-').ok_or_else(invalid)?;
    let start: i64 = start.trim().parse().map_err(|_| invalid())?;
    let end: i64 = end.trim().parse().map_err(|_| invalid())?;
    if start < 0 || end < start {
        return Err(invalid());
    }
    Ok(Some((start, end)))
}

fn content_length(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn length_mismatch(expected: i64, received: i64) -> RegistryError {
    RegistryError::RangeInvalid(format!(
        "Content-Range covers {expected} bytes, the chunk holds {received}"
    ))
}

fn lost_race(upload: &Upload) -> RegistryError {
    RegistryError::RangeInvalid(format!(
        "another request appended to upload {} concurrently",
        upload.upload_id
    ))
}

/// Stream `body` into the session as parts of about [`PART_SIZE`] bytes.
///
/// `expected` is the length the client declared for the chunk; a body of any
/// other length is refused before its remainder is stored. Unless `last`, a
/// remainder below the driver's minimum part size is held back on the row.
async fn append(
    app: &App,
    upload: &mut Upload,
    body: Body,
    expected: Option<i64>,
    last: bool,
) -> RegistryResult<()> {
    let _permit = app
        .upload_permits()
        .acquire_owned()
        .await
        .map_err(|_| RegistryError::Unavailable("server is shutting down".into()))?;

    let min_part = app.storage().min_part_size().map(|min| min as usize);
    let part_size = min_part.map_or(PART_SIZE, |min| PART_SIZE.max(min));
    let mut next_part = {
        let mut conn = app.dal().acquire().await?;
        uploads::parts(&mut conn, upload.id).await?.len() as i32 + 1
    };

    let mut buffer = upload.tail.take().unwrap_or_default();
    // session offset of buffer[0]
    let mut offset = upload.size - buffer.len() as i64;
    let mut received = 0i64;

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|err| RegistryError::BlobUploadInvalid(format!("read request body: {err}")))?;
        received += chunk.len() as i64;
        if let Some(expected) = expected.filter(|&expected| received > expected) {
            return Err(length_mismatch(expected, received));
        }
        buffer.extend_from_slice(&chunk);
        if buffer.len() >= part_size {
            write_part(app, upload, next_part, offset, &buffer).await?;
            next_part += 1;
            offset += buffer.len() as i64;
            buffer.clear();
        }
    }
    if let Some(expected) = expected.filter(|&expected| received != expected) {
        return Err(length_mismatch(expected, received));
    }

    if buffer.is_empty() {
        return Ok(());
    }
    if last || min_part.is_none_or(|min| buffer.len() >= min) {
        write_part(app, upload, next_part, offset, &buffer).await
    } else {
        hold_tail(app, upload, offset, buffer).await
    }
}

/// Send `data`, which starts at session offset `start`, as part `number`.
async fn write_part(
    app: &App,
    upload: &mut Upload,
    number: i32,
    start: i64,
    data: &[u8],
) -> RegistryResult<()> {
    let end = start + data.len() as i64 - 1;
    {
        let mut conn = app.dal().acquire().await?;
        check_quota(&mut conn, upload, end + 1, false).await?;
    }

    let part = app
        .storage()
        .upload_part(
            &paths::upload(&upload.upload_id),
            &upload.driver_upload_id,
            number,
            &mut &data[..],
            data.len() as u64,
        )
        .await?;

    let mut conn = app.dal().acquire().await?;
    if !uploads::append_part(&mut conn, upload, i64::from(number), &part.etag, start, end).await? {
        return Err(lost_race(upload));
    }
    upload.size = end + 1;
    tracing::trace!(upload_id = %upload.upload_id, number, size = upload.size, "part stored");
    Ok(())
}

/// Keep `tail`, which starts at session offset `start`, on the session row.
async fn hold_tail(app: &App, upload: &mut Upload, start: i64, tail: Vec<u8>) -> RegistryResult<()> {
    let size = start + tail.len() as i64;
    if size == upload.size {
        upload.tail = Some(tail);
        return Ok(());
    }
    let mut conn = app.dal().acquire().await?;
    check_quota(&mut conn, upload, size, false).await?;
    if !uploads::stash_tail(&mut conn, upload, size, &tail).await? {
        return Err(lost_race(upload));
    }
    upload.size = size;
    upload.tail = Some(tail);
    tracing::trace!(upload_id = %upload.upload_id, size, "tail held back");
    Ok(())
}

/// Refuse to let `upload` grow to `total` bytes if that pushes its namespace
/// or repository past the size limit. Usage is the committed size plus every
/// other open session. With `lock` the rows are write-locked first, which
/// serializes this against commits and manifest pushes in the same scope.
async fn check_quota(
    conn: &mut AnyConnection,
    upload: &Upload,
    total: i64,
    lock: bool,
) -> RegistryResult<()> {
    let name = upload.repository.as_str();
    let namespace = name.split('/').next().unwrap_or(name);
    if let Some(mut ns) = namespaces::find_by_name(&mut *conn, namespace).await? {
        if lock {
            ns = namespaces::lock(&mut *conn, ns.id).await?;
        }
        let pending = uploads::open_size_in_namespace(&mut *conn, &ns.name, upload.id).await?;
        quota::check_size("namespace", &ns.name, ns.size + pending, ns.size_limit, total)?;
    }
    if let Some(mut repo) = repositories::find_by_name(&mut *conn, name).await? {
        if lock {
            repo = repositories::lock(&mut *conn, repo.id).await?;
        }
        let pending = uploads::open_size_in_repository(&mut *conn, &repo.name, upload.id).await?;
        quota::check_size("repository", &repo.name, repo.size + pending, repo.size_limit, total)?;
    }
    Ok(())
}

/// Whether the upload's repository already references the blob, so
/// committing it again adds nothing to any quota.
async fn already_counted(
    conn: &mut AnyConnection,
    upload: &Upload,
    digest: &Digest,
) -> RegistryResult<bool> {
    let Some(repo) = repositories::find_by_name(&mut *conn, &upload.repository).await? else {
        return Ok(false);
    };
    let Some(blob) = blobs::find_by_digest(&mut *conn, &digest.to_string()).await? else {
        return Ok(false);
    };
    let referenced = repositories::referenced_blob_ids(conn, repo.id, &[blob.id]).await?;
    Ok(referenced.contains(&blob.id))
}

/// Drop the assembled object of a refused upload and close its session.
async fn discard(app: &App, upload: &Upload) -> RegistryResult<()> {
    if let Err(error) = app.storage().delete(&paths::upload(&upload.upload_id)).await {
        tracing::warn!(%error, upload_id = %upload.upload_id, "could not remove rejected upload");
    }
    let mut conn = app.dal().acquire().await?;
    uploads::finish(&mut conn, upload.id, uploads::ABORTED).await?;
    Ok(())
}

/// Append the final body, assemble the object, verify it and record the
/// blob.
///
/// The blob row is written before the object is moved into place. The
/// sweeper never deletes a row refreshed after it listed it, so once the row
/// is committed the canonical object stays.
async fn finish(
    request: &Request,
    upload: &mut Upload,
    digest: &Digest,
    body: Body,
) -> RegistryResult<Response> {
    let app = &request.app;
    append(app, upload, body, None, true).await?;

    let path = paths::upload(&upload.upload_id);
    let parts: Vec<Part> = {
        let mut conn = app.dal().acquire().await?;
        uploads::parts(&mut conn, upload.id)
            .await?
            .into_iter()
            .map(|part| Part {
                number: part.part_number as i32,
                etag: part.etag,
            })
            .collect()
    };
    app.storage()
        .commit_upload(&path, &upload.driver_upload_id, &parts)
        .await?;

    let mut reader = app.storage().reader(&path).await?;
    let (actual, size) = Digester::read_all(digest.algorithm(), &mut reader).await?;
    drop(reader);
    if &actual != digest {
        discard(app, upload).await?;
        return Err(RegistryError::DigestInvalid(format!(
            "expected {digest}, content hashes to {actual}"
        )));
    }

    let content_type = request
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("application/octet-stream");
    let mut tx = app.dal().begin().await?;
    if !already_counted(tx.conn(), upload, digest).await? {
        if let Err(err) = check_quota(tx.conn(), upload, upload.size, true).await {
            tx.rollback().await?;
            discard(app, upload).await?;
            return Err(err);
        }
    }
    blobs::upsert(tx.conn(), &digest.to_string(), size as i64, content_type).await?;
    if !uploads::finish(tx.conn(), upload.id, uploads::COMMITTED).await? {
        tx.rollback().await?;
        return Err(RegistryError::BlobUploadUnknown(upload.upload_id.clone()));
    }
    tx.commit().await?;

    let blob_path = digest.blob_path();
    if app.storage().exists(&blob_path).await? {
        app.storage().delete(&path).await?;
    } else {
        app.storage().move_object(&path, &blob_path).await?;
    }

    tracing::info!(%digest, size, repository = %request.name, "blob committed");
    Ok(committed(&request.name, digest))
}

fn committed(name: &str, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
            (CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn with_range(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn content_range_forms() {
        assert_eq!(content_range(&HeaderMap::new()).unwrap(), None);
        assert_eq!(content_range(&with_range("0-3")).unwrap(), Some((0, 3)));
        assert_eq!(content_range(&with_range("bytes 4-7/8")).unwrap(), Some((4, 7)));
        assert_eq!(
            content_range(&with_range("7-4")).unwrap_err().error_code(),
            "RANGE_INVALID"
        );
        assert!(content_range(&with_range("nope")).is_err());
    }

    #[test]
    fn declared_length_comes_from_content_length() {
        let mut headers = with_range("0-99");
        assert_eq!(content_length(&headers), None);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("4"));
        assert_eq!(content_length(&headers), Some(4));
        assert_eq!(length_mismatch(100, 4).error_code(), "RANGE_INVALID");
    }

    #[test]
    fn range_of_empty_and_filled_sessions() {
        assert_eq!(range(0), "0-0");
        assert_eq!(range(4), "0-3");
    }
}
