use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use super::{Action, Request};
use crate::dal::{repositories, tags};
use crate::error::{RegistryError, RegistryResult};

/// Page size when the client doesn't ask for one.
const DEFAULT_PAGE: i64 = 1000;
/// Largest page served.
const MAX_PAGE: i64 = 10_000;

#[derive(Debug, Serialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

fn page_size(n: Option<&str>) -> RegistryResult<i64> {
    let Some(n) = n else {
        return Ok(DEFAULT_PAGE);
    };
    match n.parse::<i64>() {
        Ok(n) if n > 0 => Ok(n.min(MAX_PAGE)),
        _ => Err(RegistryError::PaginationNumberInvalid(n.to_owned())),
    }
}

/// `GET /v2/<name>/tags/list?n=<n>&last=<last>`
pub(super) async fn list(request: Request) -> RegistryResult<Response> {
    request.authorize(Action::Pull).await?;
    let n = page_size(request.params.get("n"))?;
    let last = request.params.get("last");

    let mut conn = request.app.dal().acquire().await?;
    let repo = repositories::find_by_name(&mut conn, &request.name)
        .await?
        .ok_or_else(|| RegistryError::NameUnknown(request.name.clone()))?;
    let mut names = tags::list_names(&mut conn, repo.id, last, n + 1).await?;

    let next = if names.len() as i64 > n {
        names.truncate(n as usize);
        names.last().map(|last| {
            let last: String = url::form_urlencoded::byte_serialize(last.as_bytes()).collect();
            format!(
                "</v2/{}/tags/list?n={n}&last={last}>; rel=\"next\"",
                request.name
            )
        })
    } else {
        None
    };

    let body = Json(TagList {
        name: request.name.clone(),
        tags: names,
    });
    Ok(match next {
        Some(link) => (StatusCode::OK, [(header::LINK, link)], body).into_response(),
        None => (StatusCode::OK, body).into_response(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_must_be_positive() {
        assert_eq!(page_size(None).unwrap(), DEFAULT_PAGE);
        assert_eq!(page_size(Some("5")).unwrap(), 5);
        assert_eq!(page_size(Some("999999")).unwrap(), MAX_PAGE);
        for bad in ["0", "-1", "ten"] {
            assert_eq!(
                page_size(Some(bad)).unwrap_err().error_code(),
                "PAGINATION_NUMBER_INVALID"
            );
        }
    }
}
