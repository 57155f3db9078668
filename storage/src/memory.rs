use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use storage_driver::paths;
use storage_driver::{
    BoxReader, Driver, Metadata, Part, Reader, StorageError, StorageErrorKind,
};

const ENGINE: &str = "memory";

#[derive(Debug, Clone)]
struct MemoryObject {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl From<Vec<u8>> for MemoryObject {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

#[derive(Debug)]
struct MemoryUpload {
    path: Utf8PathBuf,
    parts: BTreeMap<i32, Vec<u8>>,
}

fn not_found(path: &Utf8Path, context: &str) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("{path} not found")),
    )
    .path(path.as_str())
    .context(context.to_owned())
    .build()
}

fn key(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(paths::sanitize(path.as_str()))
}

/// Storage driver that keeps objects in process memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<Utf8PathBuf, MemoryObject>>,
    uploads: RwLock<HashMap<String, MemoryUpload>>,
    next_upload: AtomicU64,
    min_part_size: Option<u64>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that refuses to assemble uploads whose parts,
    /// other than the last, are smaller than `min`. Object stores such as S3
    /// behave this way.
    pub fn with_min_part_size(min: u64) -> Self {
        Self {
            min_part_size: Some(min),
            ..Self::default()
        }
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn min_part_size(&self) -> Option<u64> {
        self.min_part_size
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let objects = self.objects.read().await;
        objects
            .get(&key(path))
            .map(Metadata::from)
            .ok_or_else(|| not_found(path, "metadata"))
    }

    async fn upload(
        &self,
        path: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        self.objects.write().await.insert(key(path), buf.into());
        Ok(())
    }

    async fn reader(&self, path: &Utf8Path) -> Result<BoxReader, StorageError> {
        let objects = self.objects.read().await;
        let object = objects
            .get(&key(path))
            .ok_or_else(|| not_found(path, "reader"))?;
        Ok(Box::new(std::io::Cursor::new(object.data.clone())))
    }

    async fn move_object(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        let mut objects = self.objects.write().await;
        let object = objects
            .remove(&key(src))
            .ok_or_else(|| not_found(src, "move"))?;
        objects.insert(key(dst), object);
        Ok(())
    }

    async fn delete(&self, prefix: &Utf8Path) -> Result<(), StorageError> {
        let prefix = paths::sanitize(prefix.as_str()).to_owned();
        self.objects
            .write()
            .await
            .retain(|path, _| !paths::within_prefix(&prefix, path.as_str()));
        self.uploads
            .write()
            .await
            .retain(|_, upload| !paths::within_prefix(&prefix, upload.path.as_str()));
        Ok(())
    }

    async fn create_upload_id(&self, path: &Utf8Path) -> Result<String, StorageError> {
        let id = format!(
            "mem-{}",
            self.next_upload.fetch_add(1, Ordering::Relaxed)
        );
        self.uploads.write().await.insert(
            id.clone(),
            MemoryUpload {
                path: key(path),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        number: i32,
        reader: &mut Reader<'_>,
        size: u64,
    ) -> Result<Part, StorageError> {
        let mut buf = Vec::with_capacity(size as usize);
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        let mut uploads = self.uploads.write().await;
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| not_found(path, "upload part"))?;
        let etag = format!("{number}-{}", buf.len());
        upload.parts.insert(number, buf);
        Ok(Part { number, etag })
    }

    async fn commit_upload(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        parts: &[Part],
    ) -> Result<(), StorageError> {
        let upload = self
            .uploads
            .write()
            .await
            .remove(upload_id)
            .ok_or_else(|| not_found(path, "commit upload"))?;

        let mut data = Vec::new();
        for (index, part) in parts.iter().enumerate() {
            let chunk = upload.parts.get(&part.number).ok_or_else(|| {
                StorageError::builder(
                    ENGINE,
                    StorageErrorKind::InvalidRequest,
                    format!("part {} was never uploaded", part.number),
                )
                .path(path.as_str())
                .upload_id(upload_id)
                .context("commit upload")
                .build()
            })?;
            let last = index + 1 == parts.len();
            if let Some(min) = self.min_part_size.filter(|_| !last) {
                if (chunk.len() as u64) < min {
                    return Err(StorageError::builder(
                        ENGINE,
                        StorageErrorKind::InvalidRequest,
                        format!("part {} holds {} bytes, minimum is {min}", part.number, chunk.len()),
                    )
                    .path(path.as_str())
                    .upload_id(upload_id)
                    .context("commit upload")
                    .build());
                }
            }
            data.extend_from_slice(chunk);
        }

        self.objects.write().await.insert(upload.path, data.into());
        Ok(())
    }

    async fn abort_upload(&self, _path: &Utf8Path, upload_id: &str) -> Result<(), StorageError> {
        self.uploads.write().await.remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read(driver: &MemoryStorage, path: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        driver
            .reader(Utf8Path::new(path))
            .await
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn multipart_concatenates_in_order() {
        let driver = MemoryStorage::new();
        let path = Utf8Path::new("blob_uploads/u1");
        let id = driver.create_upload_id(path).await.unwrap();

        let second = driver
            .upload_part(path, &id, 2, &mut &b"efgh"[..], 4)
            .await
            .unwrap();
        let first = driver
            .upload_part(path, &id, 1, &mut &b"abcd"[..], 4)
            .await
            .unwrap();
        driver
            .commit_upload(path, &id, &[first, second])
            .await
            .unwrap();

        assert_eq!(read(&driver, "blob_uploads/u1").await, b"abcdefgh");
    }

    #[tokio::test]
    async fn small_leading_parts_are_refused() {
        let driver = MemoryStorage::with_min_part_size(4);
        let path = Utf8Path::new("blob_uploads/u2");

        let id = driver.create_upload_id(path).await.unwrap();
        let short = driver.upload_part(path, &id, 1, &mut &b"ab"[..], 2).await.unwrap();
        let rest = driver.upload_part(path, &id, 2, &mut &b"cdef"[..], 4).await.unwrap();
        let err = driver.commit_upload(path, &id, &[short, rest]).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);

        let id = driver.create_upload_id(path).await.unwrap();
        let full = driver.upload_part(path, &id, 1, &mut &b"abcd"[..], 4).await.unwrap();
        let last = driver.upload_part(path, &id, 2, &mut &b"e"[..], 1).await.unwrap();
        driver.commit_upload(path, &id, &[full, last]).await.unwrap();
        assert_eq!(read(&driver, "blob_uploads/u2").await, b"abcde");
    }

    #[tokio::test]
    async fn delete_respects_separator() {
        let driver = MemoryStorage::new();
        for path in ["a/b", "a/b/c", "a/bc"] {
            driver
                .upload(Utf8Path::new(path), &mut &b"x"[..])
                .await
                .unwrap();
        }

        driver.delete(Utf8Path::new("a/b")).await.unwrap();

        assert!(driver.metadata(Utf8Path::new("a/b")).await.unwrap_err().is_not_found());
        assert!(driver.metadata(Utf8Path::new("a/b/c")).await.is_err());
        assert_eq!(driver.metadata(Utf8Path::new("a/bc")).await.unwrap().size, 1);
    }

    #[tokio::test]
    async fn move_removes_source() {
        let driver = MemoryStorage::new();
        driver
            .upload(Utf8Path::new("/src"), &mut &b"data"[..])
            .await
            .unwrap();
        driver
            .move_object(Utf8Path::new("src"), Utf8Path::new("dst"))
            .await
            .unwrap();
        assert!(driver.metadata(Utf8Path::new("src")).await.is_err());
        assert_eq!(read(&driver, "dst").await, b"data");
    }
}
