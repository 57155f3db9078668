use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use tracing_error::SpanTrace;

type Source = Box<dyn StdError + Send + Sync + 'static>;

/// Backend independent classification of a failed driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// No object or upload at the path.
    NotFound,
    /// The backend refused our credentials or file permissions.
    PermissionDenied,
    /// Disk or network failure.
    Io,
    /// Throttled or temporarily down.
    ServiceUnavailable,
    /// Bad path, unknown upload id or parts out of order.
    InvalidRequest,
    /// The driver lacks the capability, e.g. redirects on a filesystem.
    Unsupported,
    /// Unclassified.
    Other,
}

impl StorageErrorKind {
    /// Stable snake case name, used as a log field.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageErrorKind::NotFound => "not_found",
            StorageErrorKind::PermissionDenied => "permission_denied",
            StorageErrorKind::Io => "io",
            StorageErrorKind::ServiceUnavailable => "service_unavailable",
            StorageErrorKind::InvalidRequest => "invalid_request",
            StorageErrorKind::Unsupported => "unsupported",
            StorageErrorKind::Other => "other",
        }
    }

    /// Whether the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorKind::Io | StorageErrorKind::ServiceUnavailable)
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().replace('_', " "))
    }
}

/// Where the failing call was pointed.
#[derive(Debug, Default)]
struct Target {
    bucket: Option<String>,
    path: Option<String>,
    upload_id: Option<String>,
}

/// A failed driver call.
///
/// Carries the engine and the object it concerned, plus a backtrace and the
/// tracing span trace captured where the error was built.
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "filesystem",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
/// )
/// .path("docker/registry/v2/blobs/sha256/ab/abcd/data")
/// .context("metadata")
/// .build();
///
/// assert!(error.is_not_found());
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    operation: Option<String>,
    target: Target,
    source: Source,
    backtrace: Box<Backtrace>,
    span_trace: SpanTrace,
}

impl StorageError {
    /// An error with no object attached.
    #[track_caller]
    pub fn new<E: Into<Source>>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self {
        Self::builder(engine, kind, error).build()
    }

    /// Start an error that names its object and operation.
    pub fn builder<E: Into<Source>>(
        engine: &'static str,
        kind: StorageErrorKind,
        error: E,
    ) -> StorageErrorBuilder {
        StorageErrorBuilder {
            kind,
            engine,
            operation: None,
            target: Target::default(),
            source: error.into(),
        }
    }

    /// `map_err` adapter.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn open() -> Result<std::fs::File, StorageError> {
    ///     std::fs::File::open("missing.txt")
    ///         .map_err(StorageError::with("filesystem", StorageErrorKind::Io))
    /// }
    /// ```
    pub fn with<E: Into<Source>>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> impl FnOnce(E) -> StorageError + Send + Sync {
        move |error| StorageError::new(engine, kind, error)
    }

    /// Wrap an I/O error, mapping missing files to [`StorageErrorKind::NotFound`].
    pub fn io(engine: &'static str, error: std::io::Error) -> Self {
        let kind = match error.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        StorageError::new(engine, kind, error)
    }

    /// The driver cannot do `capability`.
    pub fn unsupported(engine: &'static str, capability: &str) -> Self {
        StorageError::new(
            engine,
            StorageErrorKind::Unsupported,
            format!("{engine} cannot {capability}"),
        )
    }

    /// Classification.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Shorthand for `kind() == NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// See [`StorageErrorKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Driver name, e.g. `s3` or `filesystem`.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Bucket of object store drivers.
    pub fn bucket(&self) -> Option<&str> {
        self.target.bucket.as_deref()
    }

    /// Path as given to the driver, or the backend key it resolved to.
    pub fn path(&self) -> Option<&str> {
        self.target.path.as_deref()
    }

    /// Multipart upload the call belonged to.
    pub fn upload_id(&self) -> Option<&str> {
        self.target.upload_id.as_deref()
    }

    /// What the driver was doing, e.g. `put object`.
    pub fn context(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// Backtrace at construction. Empty unless `RUST_BACKTRACE` is set.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Active tracing spans at construction.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.engine)?;
        if let Some(operation) = &self.operation {
            write!(f, " {operation}")?;
        }
        write!(f, " failed ({})", self.kind)?;
        match (&self.target.bucket, &self.target.path) {
            (Some(bucket), Some(path)) => write!(f, " at {bucket}/{path}")?,
            (Some(bucket), None) => write!(f, " in {bucket}")?,
            (None, Some(path)) => write!(f, " at {path}")?,
            (None, None) => {}
        }
        if let Some(upload_id) = &self.target.upload_id {
            write!(f, " [upload {upload_id}]")?;
        }
        write!(f, ": {}", self.source)
    }
}

/// Returned by [`StorageError::builder`].
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    operation: Option<String>,
    target: Target,
    source: Source,
}

impl StorageErrorBuilder {
    /// Bucket of object store drivers.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.target.bucket = Some(bucket.into());
        self
    }

    /// Object path or key.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.target.path = Some(path.into());
        self
    }

    /// Multipart upload id.
    pub fn upload_id(mut self, upload_id: impl Into<String>) -> Self {
        self.target.upload_id = Some(upload_id.into());
        self
    }

    /// Operation in progress.
    pub fn context(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Finish, capturing traces here.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            operation: self.operation,
            target: self.target,
            source: self.source,
            backtrace: Box::new(Backtrace::capture()),
            span_trace: SpanTrace::capture(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_map_onto_storage_kinds() {
        let missing = StorageError::io("filesystem", std::io::ErrorKind::NotFound.into());
        assert!(missing.is_not_found());

        let denied = StorageError::io("filesystem", std::io::ErrorKind::PermissionDenied.into());
        assert_eq!(denied.kind(), StorageErrorKind::PermissionDenied);
        assert!(!denied.is_retryable());

        let reset = StorageError::io("filesystem", std::io::ErrorKind::ConnectionReset.into());
        assert!(reset.is_retryable());
    }

    #[test]
    fn display_names_the_object() {
        let err = StorageError::builder("s3", StorageErrorKind::Io, "boom")
            .bucket("registry")
            .path("uploads/u1")
            .upload_id("mp-7")
            .context("upload part")
            .build();
        assert_eq!(
            err.to_string(),
            "s3 upload part failed (io) at registry/uploads/u1 [upload mp-7]: boom"
        );
        assert_eq!(err.upload_id(), Some("mp-7"));
    }

    #[test]
    fn unsupported_capabilities() {
        let err = StorageError::unsupported("filesystem", "presign urls");
        assert_eq!(err.kind(), StorageErrorKind::Unsupported);
        assert_eq!(
            err.to_string(),
            "filesystem failed (unsupported): filesystem cannot presign urls"
        );
    }
}
