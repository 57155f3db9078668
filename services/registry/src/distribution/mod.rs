//! OCI Distribution v2 API.
//!
//! Repository names contain slashes, so everything below `/v2/` goes through
//! one wildcard route and [`Route::parse`] splits the path from the right on
//! the API's fixed segments (`manifests`, `blobs`, `tags/list`, ...).

use std::collections::HashMap;
use std::sync::LazyLock;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Extension;
use regex::Regex;

use crate::app::App;
use crate::auth::Caller;
use crate::error::{RegistryError, RegistryResult};

mod access;
mod blobs;
mod manifests;
mod referrers;
mod tags;
mod uploads;

pub(crate) use access::Action;

/// Digest of the content a response describes.
pub const CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
/// Id of an upload session.
pub const UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

static NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$",
    )
    .expect("repository name pattern")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").expect("tag pattern"));

const MAX_NAME_LEN: usize = 255;

pub(crate) fn router() -> Router<App> {
    Router::new()
        .route("/v2", get(probe))
        .route("/v2/", get(probe))
        .route("/v2/{*path}", any(dispatch))
}

/// `GET /v2/`: tells clients the API exists and, when authentication is on,
/// where to get a token.
async fn probe(State(app): State<App>, Extension(caller): Extension<Caller>) -> Response {
    match (app.auth(), &caller.0) {
        (Some(auth), None) => auth.unauthorized("authentication required").into_response(),
        _ => (StatusCode::OK, Json(serde_json::json!({}))).into_response(),
    }
}

/// Which endpoint a `/v2/` path addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Tags { name: String },
    Manifest { name: String, reference: String },
    Uploads { name: String },
    Upload { name: String, id: String },
    Blob { name: String, digest: String },
    Referrers { name: String, digest: String },
}

impl Route {
    fn parse(path: &str) -> RegistryResult<Self> {
        let path = path.trim_start_matches('/');
        let route = if let Some(name) = path.strip_suffix("/tags/list") {
            Route::Tags { name: name.into() }
        } else if let Some((name, reference)) = path.rsplit_once("/manifests/") {
            Route::Manifest {
                name: name.into(),
                reference: reference.into(),
            }
        } else if let Some(name) = path
            .strip_suffix("/blobs/uploads/")
            .or_else(|| path.strip_suffix("/blobs/uploads"))
        {
            Route::Uploads { name: name.into() }
        } else if let Some((name, id)) = path.rsplit_once("/blobs/uploads/") {
            Route::Upload {
                name: name.into(),
                id: id.into(),
            }
        } else if let Some((name, digest)) = path.rsplit_once("/blobs/") {
            Route::Blob {
                name: name.into(),
                digest: digest.into(),
            }
        } else if let Some((name, digest)) = path.rsplit_once("/referrers/") {
            Route::Referrers {
                name: name.into(),
                digest: digest.into(),
            }
        } else {
            return Err(RegistryError::NotFound(format!("/v2/{path}")));
        };
        validate_name(route.name())?;
        Ok(route)
    }

    fn name(&self) -> &str {
        match self {
            Route::Tags { name }
            | Route::Manifest { name, .. }
            | Route::Uploads { name }
            | Route::Upload { name, .. }
            | Route::Blob { name, .. }
            | Route::Referrers { name, .. } => name,
        }
    }
}

fn validate_name(name: &str) -> RegistryResult<()> {
    if name.len() > MAX_NAME_LEN || !NAME.is_match(name) {
        return Err(RegistryError::NameInvalid(name.to_owned()));
    }
    Ok(())
}

pub(crate) fn validate_tag(tag: &str) -> RegistryResult<()> {
    if !TAG.is_match(tag) {
        return Err(RegistryError::ManifestInvalid(format!("invalid tag {tag:?}")));
    }
    Ok(())
}

/// Decoded query string.
#[derive(Debug, Default)]
pub(crate) struct Params(HashMap<String, String>);

impl Params {
    fn parse(query: Option<&str>) -> Self {
        Params(
            query
                .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
                .unwrap_or_default(),
        )
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// One request against a repository.
#[derive(Debug)]
pub(crate) struct Request {
    pub app: App,
    pub caller: Caller,
    pub name: String,
    pub params: Params,
    pub headers: HeaderMap,
}

impl Request {
    /// Fail unless the caller may perform `action` on this repository.
    pub async fn authorize(&self, action: Action) -> RegistryResult<()> {
        access::authorize(&self.app, &self.caller, &self.name, action).await
    }
}

async fn dispatch(
    State(app): State<App>,
    Extension(caller): Extension<Caller>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> RegistryResult<Response> {
    let route = Route::parse(&path)?;
    let request = Request {
        app,
        caller,
        name: route.name().to_owned(),
        params: Params::parse(query.as_deref()),
        headers,
    };

    match (route, method.as_str()) {
        (Route::Tags { .. }, "GET") => tags::list(request).await,
        (Route::Manifest { reference, .. }, "GET") => {
            manifests::get(request, &reference, true).await
        }
        (Route::Manifest { reference, .. }, "HEAD") => {
            manifests::get(request, &reference, false).await
        }
        (Route::Manifest { reference, .. }, "PUT") => {
            manifests::put(request, &reference, body).await
        }
        (Route::Manifest { reference, .. }, "DELETE") => {
            manifests::delete(request, &reference).await
        }
        (Route::Uploads { .. }, "POST") => uploads::start(request, body).await,
        (Route::Upload { id, .. }, "GET") => uploads::status(request, &id).await,
        (Route::Upload { id, .. }, "PATCH") => uploads::patch(request, &id, body).await,
        (Route::Upload { id, .. }, "PUT") => uploads::complete(request, &id, body).await,
        (Route::Upload { id, .. }, "DELETE") => uploads::cancel(request, &id).await,
        (Route::Blob { digest, .. }, "GET") => blobs::get(request, &digest, true).await,
        (Route::Blob { digest, .. }, "HEAD") => blobs::get(request, &digest, false).await,
        (Route::Blob { .. }, "DELETE") => Err(RegistryError::Unsupported(
            "blobs are removed by garbage collection".into(),
        )),
        (Route::Referrers { digest, .. }, "GET") => referrers::list(request, &digest).await,
        (_, method) => Err(RegistryError::Unsupported(format!("{method} /v2/{path}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str) -> Route {
        Route::parse(path).unwrap()
    }

    #[test]
    fn paths_split_on_the_last_api_segment() {
        assert_eq!(
            route("library/app/manifests/latest"),
            Route::Manifest {
                name: "library/app".into(),
                reference: "latest".into()
            }
        );
        assert_eq!(
            route("a/blobs/b/blobs/sha256:abc"),
            Route::Blob {
                name: "a/blobs/b".into(),
                digest: "sha256:abc".into()
            }
        );
        assert_eq!(
            route("library/app/blobs/uploads/"),
            Route::Uploads {
                name: "library/app".into()
            }
        );
        assert_eq!(
            route("library/app/blobs/uploads/u1"),
            Route::Upload {
                name: "library/app".into(),
                id: "u1".into()
            }
        );
        assert_eq!(
            route("x/y/z/tags/list"),
            Route::Tags {
                name: "x/y/z".into()
            }
        );
        assert_eq!(
            route("library/app/referrers/sha256:abc"),
            Route::Referrers {
                name: "library/app".into(),
                digest: "sha256:abc".into()
            }
        );
    }

    #[test]
    fn bad_names_and_unknown_paths() {
        let err = Route::parse("Library/App/tags/list").unwrap_err();
        assert_eq!(err.error_code(), "NAME_INVALID");
        assert!(Route::parse("library/app/other").is_err());
        assert!(validate_name("a__b/c-d.e").is_ok());
        assert!(validate_name("a/").is_err());
    }

    #[test]
    fn tags_follow_the_grammar() {
        assert!(validate_tag("v1.0_rc-1").is_ok());
        assert!(validate_tag(".hidden").is_err());
        assert!(validate_tag(&"x".repeat(129)).is_err());
    }

    #[test]
    fn empty_params_are_absent() {
        let params = Params::parse(Some("n=10&last=&digest=sha256%3Aab"));
        assert_eq!(params.get("n"), Some("10"));
        assert_eq!(params.get("last"), None);
        assert_eq!(params.get("digest"), Some("sha256:ab"));
    }
}
