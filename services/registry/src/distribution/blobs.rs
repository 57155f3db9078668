use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;

use super::{Action, CONTENT_DIGEST, Request};
use crate::dal::blobs;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// `GET`/`HEAD /v2/<name>/blobs/<digest>`.
///
/// A GET counts as a pull for garbage collection. With redirects enabled on
/// a driver that supports them the client is sent to a presigned URL.
pub(super) async fn get(request: Request, digest: &str, with_body: bool) -> RegistryResult<Response> {
    request.authorize(Action::Pull).await?;
    let digest: Digest = digest.parse()?;
    let app = &request.app;

    let blob = {
        let mut conn = app.dal().acquire().await?;
        let blob = blobs::find_by_digest(&mut conn, &digest.to_string())
            .await?
            .ok_or_else(|| RegistryError::BlobUnknown(digest.to_string()))?;
        if with_body {
            blobs::touch_pull(&mut conn, blob.id).await?;
        }
        blob
    };

    let headers = [
        (header::CONTENT_TYPE, blob.content_type.clone()),
        (header::CONTENT_LENGTH, blob.size.to_string()),
        (CONTENT_DIGEST, blob.digest.clone()),
    ];
    if !with_body {
        return Ok((StatusCode::OK, headers).into_response());
    }

    let redirect = &app.config().storage.redirect;
    if redirect.enabled && app.storage().supports_redirect() {
        let url = app.storage().redirect(&digest.blob_path(), redirect.ttl).await?;
        tracing::debug!(%digest, "redirecting blob download");
        return Ok((
            StatusCode::TEMPORARY_REDIRECT,
            [
                (header::LOCATION, url),
                (CONTENT_DIGEST, blob.digest),
            ],
        )
            .into_response());
    }

    let reader = app.storage().reader(&digest.blob_path()).await?;
    let body = Body::from_stream(ReaderStream::new(reader));
    Ok((StatusCode::OK, headers, body).into_response())
}
