//! Error types for the registry

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::dal::DalError;
use crate::workq::WorkQueueError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Missing or invalid credentials
    #[error("authentication required: {message}")]
    Unauthorized {
        /// Why the request was rejected
        message: String,
        /// `WWW-Authenticate` challenge to send back
        challenge: Option<String>,
    },

    /// Authenticated but not allowed
    #[error("requested access to the resource is denied: {0}")]
    Denied(String),

    /// A write would exceed a size or count quota
    #[error("{0}")]
    QuotaExceeded(String),

    /// Too many concurrent requests
    #[error("too many requests: {0}")]
    TooManyRequests(String),

    /// Invalid digest format, or content doesn't match its digest
    #[error("provided digest did not match uploaded content: {0}")]
    DigestInvalid(String),

    /// Manifest not found
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// Manifest could not be parsed
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    /// Manifest references a blob the registry doesn't have
    #[error("blob unknown to registry: {0}")]
    ManifestBlobUnknown(String),

    /// Manifest pushed to a repository without a namespace
    #[error("repository {0} must be placed under a namespace")]
    ManifestWithNamespace(String),

    /// Blob not found
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    /// Upload session not found or already finished
    #[error("blob upload unknown to registry: {0}")]
    BlobUploadUnknown(String),

    /// Upload request malformed
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// Repository or namespace not found
    #[error("repository name not known to registry: {0}")]
    NameUnknown(String),

    /// Upload chunk is not contiguous
    #[error("invalid content range: {0}")]
    RangeInvalid(String),

    /// Declared length doesn't match content
    #[error("provided length did not match content length: {0}")]
    SizeInvalid(String),

    /// Bad `n` in a paginated request
    #[error("invalid number of results requested: {0}")]
    PaginationNumberInvalid(String),

    /// Entity exists already
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed request outside the distribution codes
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Generic missing entity
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation isn't implemented
    #[error("the operation is unsupported: {0}")]
    Unsupported(String),

    /// A dependency is unavailable
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Database error
    #[error("database error: {0}")]
    Dal(#[from] DalError),

    /// Work queue error
    #[error("work queue error: {0}")]
    WorkQueue(#[from] WorkQueueError),

    /// Lock error
    #[error("lock error: {0}")]
    Lock(#[from] locker::LockError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            RegistryError::Denied(_) | RegistryError::QuotaExceeded(_) => StatusCode::FORBIDDEN,
            RegistryError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            RegistryError::ManifestUnknown(_)
            | RegistryError::BlobUnknown(_)
            | RegistryError::BlobUploadUnknown(_)
            | RegistryError::NameUnknown(_)
            | RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::DigestInvalid(_)
            | RegistryError::ManifestInvalid(_)
            | RegistryError::ManifestBlobUnknown(_)
            | RegistryError::ManifestWithNamespace(_)
            | RegistryError::BlobUploadInvalid(_)
            | RegistryError::NameInvalid(_)
            | RegistryError::SizeInvalid(_)
            | RegistryError::PaginationNumberInvalid(_)
            | RegistryError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RegistryError::RangeInvalid(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Lock(locker::LockError::Timeout(_)) => StatusCode::TOO_MANY_REQUESTS,
            RegistryError::Storage(err) if err.is_not_found() => StatusCode::NOT_FOUND,
            RegistryError::Storage(err) if err.kind().is_retryable() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RegistryError::Dal(DalError::NotFound(_)) => StatusCode::NOT_FOUND,
            RegistryError::Dal(DalError::Conflict(_)) => StatusCode::CONFLICT,
            RegistryError::Storage(_)
            | RegistryError::Dal(_)
            | RegistryError::WorkQueue(_)
            | RegistryError::Lock(_)
            | RegistryError::Io(_)
            | RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::Unauthorized { .. } => "UNAUTHORIZED",
            RegistryError::Denied(_) | RegistryError::QuotaExceeded(_) => "DENIED",
            RegistryError::TooManyRequests(_) => "TOOMANYREQUESTS",
            RegistryError::DigestInvalid(_) => "DIGEST_INVALID",
            RegistryError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            RegistryError::ManifestInvalid(_) => "MANIFEST_INVALID",
            RegistryError::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::ManifestWithNamespace(_) => "MANIFEST_WITH_NAMESPACE",
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::NameInvalid(_) => "NAME_INVALID",
            RegistryError::NameUnknown(_) => "NAME_UNKNOWN",
            RegistryError::RangeInvalid(_) => "RANGE_INVALID",
            RegistryError::SizeInvalid(_) => "SIZE_INVALID",
            RegistryError::PaginationNumberInvalid(_) => "PAGINATION_NUMBER_INVALID",
            RegistryError::Conflict(_) => "CONFLICT",
            RegistryError::BadRequest(_) => "BAD_REQUEST",
            RegistryError::NotFound(_) => "NOT_FOUND",
            RegistryError::Unsupported(_) => "UNSUPPORTED",
            RegistryError::Unavailable(_) => "UNAVAILABLE",
            RegistryError::Lock(locker::LockError::Timeout(_)) => "TOOMANYREQUESTS",
            RegistryError::Storage(err) if err.is_not_found() => "BLOB_UNKNOWN",
            RegistryError::Storage(err) if err.kind().is_retryable() => "UNAVAILABLE",
            RegistryError::Dal(DalError::NotFound(_)) => "NOT_FOUND",
            RegistryError::Dal(DalError::Conflict(_)) => "CONFLICT",
            RegistryError::Storage(_)
            | RegistryError::Dal(_)
            | RegistryError::WorkQueue(_)
            | RegistryError::Lock(_)
            | RegistryError::Io(_)
            | RegistryError::Internal(_) => "UNKNOWN",
        }
    }

    /// Shorthand for a missing-credentials error carrying a challenge.
    pub fn unauthorized(message: impl Into<String>, challenge: Option<String>) -> Self {
        RegistryError::Unauthorized {
            message: message.into(),
            challenge,
        }
    }

    fn log(&self) {
        if self.status_code().is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, code = self.error_code(), "request rejected");
        }
    }

    /// Render with the plain `{"code","message"}` envelope used outside `/v2/`.
    pub fn into_plain_response(self) -> Response {
        self.log();
        let body = PlainError {
            code: self.error_code(),
            message: self.to_string(),
        };
        (self.status_code(), axum::Json(body)).into_response()
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    detail: serde_json::Value,
}

#[derive(Debug, serde::Serialize)]
struct PlainError {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        let challenge = match &self {
            RegistryError::Unauthorized {
                challenge: Some(challenge),
                ..
            } => HeaderValue::from_str(challenge).ok(),
            _ => None,
        };

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code,
                message,
                detail: serde_json::Value::Null,
            }],
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(challenge) = challenge {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, challenge);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn envelope_carries_code_and_challenge() {
        let err = RegistryError::unauthorized(
            "no credentials",
            Some(r#"Bearer realm="http://r/v2/token",service="registry""#.into()),
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "UNAUTHORIZED");
        assert!(json["errors"][0].get("detail").is_some());
    }

    #[test]
    fn storage_not_found_maps_to_blob_unknown() {
        let err = RegistryError::from(storage::StorageError::new(
            "memory",
            storage::StorageErrorKind::NotFound,
            "gone",
        ));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), "BLOB_UNKNOWN");
    }

    #[test]
    fn namespace_rule_has_its_own_code() {
        let err = RegistryError::ManifestWithNamespace("nginx".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "MANIFEST_WITH_NAMESPACE");
    }
}
