//! # Storage backends
//!
//! Configuration and unification for the blob storage drivers.

use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tokio::io::{self, AsyncReadExt};

mod dummy;
mod local;
mod memory;
mod s3;

#[doc(inline)]
pub use dummy::DummyDriver;
#[doc(inline)]
pub use local::LocalDriver;
#[doc(inline)]
pub use memory::MemoryStorage;
#[doc(inline)]
pub use s3::{S3Config, S3Driver, S3Flavor};

#[doc(inline)]
pub use storage_driver::{
    paths, BoxReader, Driver, Metadata, Part, StorageError, StorageErrorKind,
};

/// Which driver to build, selected by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// A local directory.
    Filesystem {
        /// Directory holding every object.
        path: Utf8PathBuf,
    },

    /// Amazon S3 or a compatible service.
    S3(S3Config),

    /// Aliyun OSS through its S3-compatible endpoint.
    Oss(S3Config),

    /// Tencent COS through its S3-compatible endpoint.
    Cos(S3Config),

    /// Accept writes, store nothing.
    Dummy,

    /// Process memory; lost on restart.
    Memory,
}

/// Storage configuration: a backend plus the root directory all object
/// paths are placed under.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// The selected driver.
    #[serde(flatten)]
    pub backend: BackendConfig,

    /// Prefix for every object key.
    #[serde(default)]
    pub root_directory: Utf8PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Filesystem {
                path: Utf8PathBuf::from("./storage"),
            },
            root_directory: Utf8PathBuf::new(),
        }
    }
}

impl StorageConfig {
    /// Build the configured driver.
    #[tracing::instrument(skip(self))]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let root = self.root_directory;
        let storage: Storage = match self.backend {
            BackendConfig::Filesystem { path } => {
                LocalDriver::new(paths::join_root(&path, &root)).into()
            }
            BackendConfig::S3(config) => S3Driver::new(S3Flavor::Aws, config, root).await?.into(),
            BackendConfig::Oss(config) => {
                S3Driver::new(S3Flavor::AliOss, config, root).await?.into()
            }
            BackendConfig::Cos(config) => {
                S3Driver::new(S3Flavor::TencentCos, config, root)
                    .await?
                    .into()
            }
            BackendConfig::Dummy => DummyDriver.into(),
            BackendConfig::Memory => MemoryStorage::new().into(),
        };
        tracing::info!(driver = storage.name(), "storage configured");
        Ok(storage)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cloneable handle to the configured driver, with instrumented calls.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Name of the underlying driver.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// Smallest accepted multipart part size, if the driver has one.
    pub fn min_part_size(&self) -> Option<u64> {
        self.driver.min_part_size()
    }

    /// Whether presigned redirects are available.
    pub fn supports_redirect(&self) -> bool {
        self.driver.supports_redirect()
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(path).await
    }

    /// Whether an object exists. Errors other than not-found propagate.
    pub async fn exists(&self, path: &Utf8Path) -> Result<bool, StorageError> {
        match self.driver.metadata(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(skip(self, reader), fields(driver = self.driver.name()))]
    pub async fn upload<R>(&self, path: &Utf8Path, reader: &mut R) -> Result<(), StorageError>
    where
        R: io::AsyncRead + Unpin + Send,
    {
        tracing::trace!(%path, "uploading");
        self.driver.upload(path, reader).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn reader(&self, path: &Utf8Path) -> Result<BoxReader, StorageError> {
        self.driver.reader(path).await
    }

    /// Read a whole object into memory.
    pub async fn read_to_vec(&self, path: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.reader(path).await?;
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::io(self.name(), err))?;
        Ok(buf)
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn move_object(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        self.driver.move_object(src, dst).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn delete(&self, prefix: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(prefix).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn redirect(&self, path: &Utf8Path, ttl: Duration) -> Result<String, StorageError> {
        self.driver.redirect(path, ttl).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn create_upload_id(&self, path: &Utf8Path) -> Result<String, StorageError> {
        self.driver.create_upload_id(path).await
    }

    #[tracing::instrument(skip(self, reader), fields(driver = self.driver.name()))]
    pub async fn upload_part<R>(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        number: i32,
        reader: &mut R,
        size: u64,
    ) -> Result<Part, StorageError>
    where
        R: io::AsyncRead + Unpin + Send,
    {
        self.driver
            .upload_part(path, upload_id, number, reader, size)
            .await
    }

    #[tracing::instrument(skip(self, parts), fields(driver = self.driver.name(), parts = parts.len()))]
    pub async fn commit_upload(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        parts: &[Part],
    ) -> Result<(), StorageError> {
        self.driver.commit_upload(path, upload_id, parts).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn abort_upload(&self, path: &Utf8Path, upload_id: &str) -> Result<(), StorageError> {
        self.driver.abort_upload(path, upload_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        storage: StorageConfig,
    }

    #[test]
    fn config_selects_backend_by_type() {
        let config: StorageConfig = serde_json::from_value(serde_json::json!({
            "type": "s3",
            "bucket": "registry",
            "endpoint": "http://minio:9000",
            "forcePathStyle": true,
            "rootDirectory": "oci",
        }))
        .unwrap();
        assert_eq!(config.root_directory, Utf8PathBuf::from("oci"));
        match config.backend {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "registry");
                assert!(s3.force_path_style);
            }
            other => panic!("unexpected backend {other:?}"),
        }

        let wrapped: Wrapper = serde_json::from_value(serde_json::json!({
            "storage": { "type": "filesystem", "path": "/var/lib/registry" }
        }))
        .unwrap();
        assert!(matches!(
            wrapped.storage.backend,
            BackendConfig::Filesystem { .. }
        ));
    }

    #[tokio::test]
    async fn handle_reports_existence() {
        let storage: Storage = MemoryStorage::new().into();
        let path = Utf8Path::new("blobs/sha256/aa/bb/aabb");
        assert!(!storage.exists(path).await.unwrap());
        storage.upload(path, &mut &b"abc"[..]).await.unwrap();
        assert!(storage.exists(path).await.unwrap());
        assert_eq!(storage.read_to_vec(path).await.unwrap(), b"abc");
    }
}
