use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use eyre::WrapErr;
use tokio::io::AsyncWriteExt;

use storage_driver::paths;
use storage_driver::{
    BoxReader, Driver, Metadata, Part, Reader, StorageError, StorageErrorKind,
};

const ENGINE: &str = "filesystem";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Storage driver rooted at a local directory.
///
/// Multipart parts are staged as `<path>/<part-number>` and concatenated into
/// `<path>` on commit.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

fn io_err<'a>(path: &'a Utf8Path, context: &'static str) -> impl FnOnce(std::io::Error) -> StorageError + 'a {
    move |err| {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        StorageError::builder(ENGINE, kind, err)
            .path(path.as_str())
            .context(context)
            .build()
    }
}

fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl LocalDriver {
    /// Create a driver storing everything below `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, remote: &Utf8Path) -> Utf8PathBuf {
        paths::join_root(&self.root, remote)
    }

    /// A sibling path for writing before an atomic rename.
    fn scratch(path: &Utf8Path) -> Utf8PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let name = path.file_name().unwrap_or("object");
        path.with_file_name(format!(".{name}.{stamp}.{n}.tmp"))
    }

    async fn create_parent(path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err(path, "create parent directories"))?;
        }
        Ok(())
    }

    /// Copy a reader into `path` atomically: write a sibling, then rename.
    async fn write_atomic(path: &Utf8Path, reader: &mut Reader<'_>) -> Result<u64, StorageError> {
        Self::create_parent(path).await?;
        let scratch = Self::scratch(path);

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&scratch)
                .await
                .map_err(io_err(&scratch, "create scratch file"))?,
        );
        let written = tokio::io::copy(reader, &mut writer)
            .await
            .map_err(io_err(&scratch, "copy"))?;
        writer
            .shutdown()
            .await
            .map_err(io_err(&scratch, "flush"))?;

        tokio::fs::rename(&scratch, path)
            .await
            .map_err(io_err(path, "rename into place"))?;
        Ok(written)
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(io_err(&path, "metadata"))?;
        if metadata.is_dir() {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::NotFound,
                "path is a directory",
            )
            .path(path.as_str())
            .build());
        }
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(io_err(&path, "timestamps"))?;
        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn upload(
        &self,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(remote);
        let written = Self::write_atomic(&path, reader).await?;
        tracing::trace!(%path, written, "stored object");
        Ok(())
    }

    async fn reader(&self, remote: &Utf8Path) -> Result<BoxReader, StorageError> {
        let path = self.path(remote);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(io_err(&path, "open"))?;
        Ok(Box::new(tokio::io::BufReader::new(file)))
    }

    async fn move_object(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        let src = self.path(src);
        let dst = self.path(dst);
        Self::create_parent(&dst).await?;
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(io_err(&src, "move"))?;
        Ok(())
    }

    async fn delete(&self, prefix: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(prefix);
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_err(&path, "delete")(err)),
        };

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        ignore_missing(result).map_err(io_err(&path, "delete"))
    }

    async fn create_upload_id(&self, remote: &Utf8Path) -> Result<String, StorageError> {
        let staging = self.path(remote);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(io_err(&staging, "create upload staging directory"))?;
        Ok(staging
            .file_name()
            .map(str::to_owned)
            .unwrap_or_else(|| remote.to_string()))
    }

    async fn upload_part(
        &self,
        remote: &Utf8Path,
        upload_id: &str,
        number: i32,
        reader: &mut Reader<'_>,
        size: u64,
    ) -> Result<Part, StorageError> {
        let staging = self.path(remote);
        if !tokio::fs::try_exists(&staging).await.unwrap_or(false) {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::NotFound,
                "upload was not started or already finished",
            )
            .path(staging.as_str())
            .upload_id(upload_id)
            .context("upload part")
            .build());
        }
        let part = staging.join(number.to_string());
        let written = Self::write_atomic(&part, reader).await?;
        if written != size {
            tracing::debug!(%part, written, size, "part size differs from declared size");
        }
        Ok(Part {
            number,
            etag: format!("{number}-{written}"),
        })
    }

    async fn commit_upload(
        &self,
        remote: &Utf8Path,
        _upload_id: &str,
        parts: &[Part],
    ) -> Result<(), StorageError> {
        let staging = self.path(remote);
        let assembled = Self::scratch(&staging);

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&assembled)
                .await
                .map_err(io_err(&assembled, "create assembled object"))?,
        );
        for part in parts {
            let part_path = staging.join(part.number.to_string());
            let mut file = tokio::fs::File::open(&part_path)
                .await
                .map_err(io_err(&part_path, "open part"))?;
            tokio::io::copy(&mut file, &mut writer)
                .await
                .map_err(io_err(&part_path, "append part"))?;
        }
        writer
            .shutdown()
            .await
            .map_err(io_err(&assembled, "flush"))?;

        ignore_missing(tokio::fs::remove_dir_all(&staging).await)
            .map_err(io_err(&staging, "remove staged parts"))?;
        tokio::fs::rename(&assembled, &staging)
            .await
            .map_err(io_err(&staging, "rename assembled object"))?;
        Ok(())
    }

    async fn abort_upload(&self, remote: &Utf8Path, _upload_id: &str) -> Result<(), StorageError> {
        let staging = self.path(remote);
        ignore_missing(tokio::fs::remove_dir_all(&staging).await)
            .wrap_err("remove staged parts")
            .map_err(|err| {
                StorageError::builder(ENGINE, StorageErrorKind::Io, err)
                    .path(staging.as_str())
                    .build()
            })
    }
}
