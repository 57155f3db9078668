use std::{fmt, ops::Deref, sync::Arc, time::Duration};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::StorageError;

/// A borrowed reader supplying object contents.
pub type Reader<'r> = dyn io::AsyncRead + Unpin + Send + 'r;

/// An owned reader over an object's contents.
pub type BoxReader = Box<dyn io::AsyncRead + Unpin + Send + 'static>;

/// Object metadata common to every driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// When the object was written.
    pub created: DateTime<Utc>,
}

/// A stored part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Part {
    /// One-based part number, in upload order.
    pub number: i32,

    /// Opaque tag returned by the driver, needed to commit.
    pub etag: String,
}

/// A blob storage backend.
///
/// All paths are relative; drivers resolve them under their configured root
/// with [`crate::paths::join_root`].
#[async_trait::async_trait]
pub trait Driver: fmt::Debug + Send + Sync {
    /// The name of the driver, used in logs and errors.
    fn name(&self) -> &'static str;

    /// Smallest accepted size for any multipart part but the last.
    fn min_part_size(&self) -> Option<u64> {
        None
    }

    /// Size and creation time of an object.
    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Write a whole object from a reader, replacing any existing object.
    async fn upload(&self, path: &Utf8Path, reader: &mut Reader<'_>)
        -> Result<(), StorageError>;

    /// Open an object for streaming reads.
    async fn reader(&self, path: &Utf8Path) -> Result<BoxReader, StorageError>;

    /// Move an object. The source is gone once this returns successfully.
    async fn move_object(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError>;

    /// Recursively delete `prefix`: the object itself and everything below
    /// `prefix/`. Missing objects are not an error.
    async fn delete(&self, prefix: &Utf8Path) -> Result<(), StorageError>;

    /// Whether [`Driver::redirect`] is implemented.
    fn supports_redirect(&self) -> bool {
        false
    }

    /// A time-limited URL clients can fetch the object from directly.
    async fn redirect(&self, path: &Utf8Path, ttl: Duration) -> Result<String, StorageError> {
        let _ = (path, ttl);
        Err(StorageError::unsupported(self.name(), "presign redirects"))
    }

    /// Begin a multipart upload that will produce the object at `path`.
    async fn create_upload_id(&self, path: &Utf8Path) -> Result<String, StorageError>;

    /// Store one part of a multipart upload.
    async fn upload_part(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        number: i32,
        reader: &mut Reader<'_>,
        size: u64,
    ) -> Result<Part, StorageError>;

    /// Assemble the parts, in order, into the object at `path`. Committing
    /// zero parts produces an empty object.
    async fn commit_upload(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        parts: &[Part],
    ) -> Result<(), StorageError>;

    /// Discard a multipart upload and any stored parts.
    async fn abort_upload(&self, path: &Utf8Path, upload_id: &str) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    fn min_part_size(&self) -> Option<u64> {
        self.deref().min_part_size()
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(path).await
    }

    async fn upload(
        &self,
        path: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(path, reader).await
    }

    async fn reader(&self, path: &Utf8Path) -> Result<BoxReader, StorageError> {
        self.deref().reader(path).await
    }

    async fn move_object(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        self.deref().move_object(src, dst).await
    }

    async fn delete(&self, prefix: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(prefix).await
    }

    fn supports_redirect(&self) -> bool {
        self.deref().supports_redirect()
    }

    async fn redirect(&self, path: &Utf8Path, ttl: Duration) -> Result<String, StorageError> {
        self.deref().redirect(path, ttl).await
    }

    async fn create_upload_id(&self, path: &Utf8Path) -> Result<String, StorageError> {
        self.deref().create_upload_id(path).await
    }

    async fn upload_part(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        number: i32,
        reader: &mut Reader<'_>,
        size: u64,
    ) -> Result<Part, StorageError> {
        self.deref()
            .upload_part(path, upload_id, number, reader, size)
            .await
    }

    async fn commit_upload(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        parts: &[Part],
    ) -> Result<(), StorageError> {
        self.deref().commit_upload(path, upload_id, parts).await
    }

    async fn abort_upload(&self, path: &Utf8Path, upload_id: &str) -> Result<(), StorageError> {
        self.deref().abort_upload(path, upload_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
}
