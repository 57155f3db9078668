//! S3 wire-protocol driver, also used for Aliyun OSS and Tencent COS.

use std::sync::Arc;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::Instrument;

use secret::Secret;
use storage_driver::paths;
use storage_driver::{
    BoxReader, Driver, Metadata, Part, Reader, StorageError, StorageErrorKind,
    DELETE_BATCH_SIZE, MULTIPART_COPY_CONCURRENCY, MULTIPART_COPY_PART_SIZE,
    MULTIPART_COPY_THRESHOLD,
};

/// S3 rejects parts smaller than this, except the last one.
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Characters left alone when encoding a copy source key.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Which S3-compatible service a driver talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Flavor {
    /// Amazon S3 or any S3 clone (MinIO, Ceph RGW).
    Aws,
    /// Aliyun Object Storage Service.
    AliOss,
    /// Tencent Cloud Object Storage.
    TencentCos,
}

impl S3Flavor {
    fn engine(self) -> &'static str {
        match self {
            S3Flavor::Aws => "s3",
            S3Flavor::AliOss => "oss",
            S3Flavor::TencentCos => "cos",
        }
    }
}

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    /// Service endpoint. Required for OSS, COS and self-hosted services.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Signing region.
    #[serde(default)]
    pub region: Option<String>,

    /// Bucket holding the registry's objects.
    pub bucket: String,

    /// Access key id. When unset the ambient AWS credential chain is used.
    #[serde(default)]
    pub ak: Option<String>,

    /// Secret access key.
    #[serde(default)]
    pub sk: Option<Secret>,

    /// Address buckets as `endpoint/bucket` rather than `bucket.endpoint`.
    #[serde(default)]
    pub force_path_style: bool,
}

/// A driver backed by an S3-compatible object store.
pub struct S3Driver {
    client: Client,
    bucket: String,
    root: Utf8PathBuf,
    flavor: S3Flavor,
}

impl std::fmt::Debug for S3Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Driver")
            .field("bucket", &self.bucket)
            .field("root", &self.root)
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

fn sdk_error<E>(
    engine: &'static str,
    bucket: &str,
    key: &str,
    context: &'static str,
    err: SdkError<E>,
) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let kind = match err.raw_response().map(|raw| raw.status().as_u16()) {
        Some(404) => StorageErrorKind::NotFound,
        Some(401) | Some(403) => StorageErrorKind::PermissionDenied,
        Some(status) if status >= 500 => StorageErrorKind::ServiceUnavailable,
        Some(_) => StorageErrorKind::InvalidRequest,
        None => match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
                StorageErrorKind::ServiceUnavailable
            }
            _ => StorageErrorKind::Io,
        },
    };
    StorageError::builder(engine, kind, err)
        .bucket(bucket)
        .path(key)
        .context(context)
        .build()
}

impl S3Driver {
    /// Build a client for the configured service.
    pub async fn new(
        flavor: S3Flavor,
        config: S3Config,
        root: impl Into<Utf8PathBuf>,
    ) -> Result<Self, StorageError> {
        let engine = flavor.engine();
        if flavor != S3Flavor::Aws && config.endpoint.is_none() {
            return Err(StorageError::new(
                engine,
                StorageErrorKind::InvalidRequest,
                format!("{engine} storage requires an endpoint"),
            ));
        }

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_owned());

        let mut builder = match (config.ak, config.sk) {
            (Some(ak), Some(sk)) => {
                let credentials = aws_sdk_s3::config::Credentials::new(
                    ak,
                    sk.revealed().to_owned(),
                    None,
                    None,
                    "registry-config",
                );
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
            }
            (None, None) => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(aws_config::Region::new(region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
            _ => {
                return Err(StorageError::new(
                    engine,
                    StorageErrorKind::InvalidRequest,
                    "both ak and sk must be set when either is",
                ))
            }
        };

        builder = builder.region(aws_config::Region::new(region));
        if let Some(endpoint) = &config.endpoint {
            let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("https://{endpoint}")
            };
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
            root: root.into(),
            flavor,
        })
    }

    fn key(&self, path: &Utf8Path) -> String {
        paths::join_root(&self.root, path).into_string()
    }

    fn engine(&self) -> &'static str {
        self.flavor.engine()
    }

    fn copy_source(&self, key: &str) -> String {
        format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(key, COPY_SOURCE)
        )
    }

    async fn read_all(&self, reader: &mut Reader<'_>, hint: u64) -> Result<Vec<u8>, StorageError> {
        let mut buf = Vec::with_capacity(hint as usize);
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::io(self.engine(), err))?;
        Ok(buf)
    }

    async fn delete_batch(&self, keys: &mut Vec<String>) -> Result<(), StorageError> {
        let engine = self.engine();
        let invalid = |err: aws_sdk_s3::error::BuildError| {
            StorageError::builder(engine, StorageErrorKind::InvalidRequest, err)
                .bucket(&self.bucket)
                .build()
        };
        let objects = keys
            .drain(..)
            .map(|key| ObjectIdentifier::builder().key(key).build().map_err(invalid))
            .collect::<Result<Vec<_>, _>>()?;
        let count = objects.len();
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(invalid)?;

        self.client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|err| sdk_error(engine, &self.bucket, "", "delete objects", err))?;
        tracing::debug!(count, "deleted batch of objects");
        Ok(())
    }

    /// Copy `src` to `dst` in ranged parts, then remove `src`.
    async fn multipart_move(&self, src: &str, dst: &str, size: u64) -> Result<(), StorageError> {
        let engine = self.engine();
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(dst)
            .send()
            .await
            .map_err(|err| sdk_error(engine, &self.bucket, dst, "create multipart copy", err))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                StorageError::new(engine, StorageErrorKind::Other, "no upload id returned")
            })?
            .to_owned();

        let parts = match self.copy_parts(src, dst, &upload_id, size).await {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(dst)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(%dst, %upload_id, error = %abort, "failed to abort multipart copy");
                }
                return Err(err);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(dst)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| sdk_error(engine, &self.bucket, dst, "complete multipart copy", err))?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(src)
            .send()
            .await
            .map_err(|err| sdk_error(engine, &self.bucket, src, "delete moved source", err))?;
        Ok(())
    }

    async fn copy_parts(
        &self,
        src: &str,
        dst: &str,
        upload_id: &str,
        size: u64,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let engine = self.engine();
        let semaphore = Arc::new(Semaphore::new(MULTIPART_COPY_CONCURRENCY));
        let source = self.copy_source(src);

        let mut tasks = Vec::new();
        let mut start = 0u64;
        let mut number = 1i32;
        while start < size {
            let end = (start + MULTIPART_COPY_PART_SIZE).min(size) - 1;
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|err| StorageError::new(engine, StorageErrorKind::Other, err))?;

            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = dst.to_owned();
            let upload_id = upload_id.to_owned();
            let source = source.clone();
            tasks.push(tokio::spawn(
                async move {
                    let _permit = permit;
                    let output = client
                        .upload_part_copy()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(upload_id)
                        .part_number(number)
                        .copy_source(source)
                        .copy_source_range(format!("bytes={start}-{end}"))
                        .send()
                        .await
                        .map_err(|err| sdk_error(engine, &bucket, &key, "upload part copy", err))?;
                    let etag = output
                        .copy_part_result()
                        .and_then(|result| result.e_tag())
                        .unwrap_or_default()
                        .to_owned();
                    Ok::<_, StorageError>(
                        CompletedPart::builder()
                            .part_number(number)
                            .e_tag(etag)
                            .build(),
                    )
                }
                .in_current_span(),
            ));

            start = end + 1;
            number += 1;
        }

        let results = futures::future::try_join_all(tasks)
            .await
            .map_err(|err| StorageError::new(engine, StorageErrorKind::Other, err))?;
        results.into_iter().collect()
    }
}

#[async_trait::async_trait]
impl Driver for S3Driver {
    fn name(&self) -> &'static str {
        self.engine()
    }

    fn min_part_size(&self) -> Option<u64> {
        Some(MIN_PART_SIZE)
    }

    async fn metadata(&self, path: &Utf8Path) -> Result<Metadata, StorageError> {
        let key = self.key(path);
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| sdk_error(self.engine(), &self.bucket, &key, "head object", err))?;

        let created = output
            .last_modified()
            .and_then(|at| DateTime::<Utc>::from_timestamp(at.secs(), 0))
            .unwrap_or_else(Utc::now);
        Ok(Metadata {
            size: output.content_length().unwrap_or_default().max(0) as u64,
            created,
        })
    }

    async fn upload(&self, path: &Utf8Path, reader: &mut Reader<'_>) -> Result<(), StorageError> {
        let key = self.key(path);
        let body = self.read_all(reader, 0).await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| sdk_error(self.engine(), &self.bucket, &key, "put object", err))?;
        Ok(())
    }

    async fn reader(&self, path: &Utf8Path) -> Result<BoxReader, StorageError> {
        let key = self.key(path);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| sdk_error(self.engine(), &self.bucket, &key, "get object", err))?;
        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    async fn move_object(&self, src: &Utf8Path, dst: &Utf8Path) -> Result<(), StorageError> {
        let size = self.metadata(src).await?.size;
        let src = self.key(src);
        let dst = self.key(dst);

        if size > MULTIPART_COPY_THRESHOLD {
            tracing::debug!(%src, %dst, size, "moving with multipart copy");
            return self.multipart_move(&src, &dst, size).await;
        }

        let engine = self.engine();
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(&dst)
            .copy_source(self.copy_source(&src))
            .send()
            .await
            .map_err(|err| sdk_error(engine, &self.bucket, &src, "copy object", err))?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&src)
            .send()
            .await
            .map_err(|err| sdk_error(engine, &self.bucket, &src, "delete moved source", err))?;
        Ok(())
    }

    async fn delete(&self, prefix: &Utf8Path) -> Result<(), StorageError> {
        let prefix = self.key(prefix);
        let mut continuation: Option<String> = None;
        let mut batch = Vec::with_capacity(DELETE_BATCH_SIZE);

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|err| sdk_error(self.engine(), &self.bucket, &prefix, "list", err))?;

            for key in output.contents().iter().filter_map(|object| object.key()) {
                if !paths::within_prefix(&prefix, key) {
                    continue;
                }
                batch.push(key.to_owned());
                if batch.len() == DELETE_BATCH_SIZE {
                    self.delete_batch(&mut batch).await?;
                }
            }

            if output.is_truncated() == Some(true) {
                continuation = output.next_continuation_token().map(str::to_owned);
            } else {
                break;
            }
        }

        if !batch.is_empty() {
            self.delete_batch(&mut batch).await?;
        }
        Ok(())
    }

    fn supports_redirect(&self) -> bool {
        true
    }

    async fn redirect(&self, path: &Utf8Path, ttl: Duration) -> Result<String, StorageError> {
        let key = self.key(path);
        let engine = self.engine();
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(StorageError::with(engine, StorageErrorKind::InvalidRequest))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .presigned(presigning)
            .await
            .map_err(|err| sdk_error(engine, &self.bucket, &key, "presign", err))?;
        Ok(request.uri().to_string())
    }

    async fn create_upload_id(&self, path: &Utf8Path) -> Result<String, StorageError> {
        let key = self.key(path);
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|err| sdk_error(self.engine(), &self.bucket, &key, "create upload", err))?;
        output.upload_id().map(str::to_owned).ok_or_else(|| {
            StorageError::new(self.engine(), StorageErrorKind::Other, "no upload id returned")
        })
    }

    async fn upload_part(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        number: i32,
        reader: &mut Reader<'_>,
        size: u64,
    ) -> Result<Part, StorageError> {
        let key = self.key(path);
        let body = self.read_all(reader, size).await?;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| sdk_error(self.engine(), &self.bucket, &key, "upload part", err))?;
        Ok(Part {
            number,
            etag: output.e_tag().unwrap_or_default().to_owned(),
        })
    }

    async fn commit_upload(
        &self,
        path: &Utf8Path,
        upload_id: &str,
        parts: &[Part],
    ) -> Result<(), StorageError> {
        let key = self.key(path);
        let engine = self.engine();

        if parts.is_empty() {
            // Multipart uploads need at least one part.
            self.abort_upload(path, upload_id).await?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(Vec::new()))
                .send()
                .await
                .map_err(|err| sdk_error(engine, &self.bucket, &key, "put empty object", err))?;
            return Ok(());
        }

        let completed = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.number)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| sdk_error(engine, &self.bucket, &key, "complete upload", err))?;
        Ok(())
    }

    async fn abort_upload(&self, path: &Utf8Path, upload_id: &str) -> Result<(), StorageError> {
        let key = self.key(path);
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = sdk_error(self.engine(), &self.bucket, &key, "abort upload", err);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }
}
