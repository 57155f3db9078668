use camino::Utf8Path;

use storage_driver::{BoxReader, Driver, Metadata, Part, Reader, StorageError, StorageErrorKind};

const ENGINE: &str = "dummy";

/// A driver that accepts every write and stores nothing.
///
/// Useful for exercising the metadata path of the registry without a backing
/// store; every read answers not found.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyDriver;

fn nothing(path: &Utf8Path) -> StorageError {
    StorageError::builder(ENGINE, StorageErrorKind::NotFound, "dummy driver stores nothing")
        .path(path.as_str())
        .build()
}

async fn drain(reader: &mut Reader<'_>) -> Result<u64, StorageError> {
    let mut sink = tokio::io::sink();
    tokio::io::copy(reader, &mut sink)
        .await
        .map_err(|err| StorageError::io(ENGINE, err))
}

#[async_trait::async_trait]
impl Driver for DummyDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        Err(nothing(path))
    }

    async fn upload(&self, _path: &Utf8Path, reader: &mut Reader<'_>) -> Result<(), StorageError> {
        drain(reader).await.map(|_| ())
    }

    async fn reader(&self, path: &Utf8Path) -> Result<BoxReader, StorageError> {
        Err(nothing(path))
    }

    async fn move_object(&self, _src: &Utf8Path, _dst: &Utf8Path) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete(&self, _prefix: &Utf8Path) -> Result<(), StorageError> {
        Ok(())
    }

    async fn create_upload_id(&self, path: &Utf8Path) -> Result<String, StorageError> {
        Ok(path.to_string())
    }

    async fn upload_part(
        &self,
        _path: &Utf8Path,
        _upload_id: &str,
        number: i32,
        reader: &mut Reader<'_>,
        _size: u64,
    ) -> Result<Part, StorageError> {
        let written = drain(reader).await?;
        Ok(Part {
            number,
            etag: format!("{number}-{written}"),
        })
    }

    async fn commit_upload(
        &self,
        _path: &Utf8Path,
        _upload_id: &str,
        _parts: &[Part],
    ) -> Result<(), StorageError> {
        Ok(())
    }

    async fn abort_upload(&self, _path: &Utf8Path, _upload_id: &str) -> Result<(), StorageError> {
        Ok(())
    }
}
