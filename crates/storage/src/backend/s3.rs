//! S3-compatible storage backend.
//!
//! This module provides a storage backend implementation for S3-compatible
//! services including AWS S3, Backblaze B2, Tigris (Fly.io), MinIO and
//! others.
//!
//! # Credentials
//!
//! Credentials are provided explicitly via the configuration file.
//!
//! TODO: support `credentials: "profile:name"` in config to use AWS SDK
//! credential providers, so ~/.aws/credentials profiles work on CI runners.
//!
//! # Uploads
//!
//! Objects are streamed in parts of [`PART_SIZE`] bytes. A source that ends
//! within the first part is stored with a single `PutObject`; anything larger
//! becomes a multipart upload, which is aborted if any part fails.

use crate::{
    FileEntry, Storage,
    backend::{FileEntryStream, Sink, Source, drain},
    error::{Error, ErrorKind, Result},
    validate_path,
};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
    types::{CompletedMultipartUpload, CompletedPart},
};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;
/// Size of each multipart upload part. S3 rejects parts below 5 MiB (except
/// the last one).
pub const PART_SIZE: u64 = 8 * 1024 * 1024;

/// S3-compatible storage backend.
///
/// Stores objects in an S3 bucket, optionally under a key prefix. All keys
/// are relative to the configured prefix (if any).
///
/// # Examples
///
/// ```no_run
/// use stash_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "ci-cache",
///     "my-bucket",
///     Some("stash/".to_string()),
///     "us-west-004",
///     Some("https://s3.us-west-004.backblazeb2.com".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - AWS region or provider-specific region (e.g., "us-west-004" for Backblaze)
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - AWS/provider access key ID
    /// * `key_secret` - AWS/provider secret access key
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .map(validate_path)
            .transpose()?
            .map(|p| p.to_str().map(|s| s.to_string()).ok_or_raise(|| ErrorKind::InvalidPath(p)))
            .transpose()?;
        let credentials = Credentials::new(key_id, key_secret, None, None, "stash-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // Exponential backoff: 1 initial attempt + 3 retries
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for S3-compatible services (Backblaze, MinIO, etc.)
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Construct the full S3 key from a relative path.
    fn full_key(&self, path: &Path) -> Result<String> {
        let validated = validate_path(path)?;
        let path_str = validated.to_str().ok_or_raise(|| ErrorKind::InvalidPath(validated.clone()))?;
        Ok(join_key(self.prefix.as_deref(), path_str))
    }

    /// Strip the configured prefix from an S3 key to get relative path.
    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        validate_path(strip_key(self.prefix.as_deref(), key))
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("request limiter closed".to_string()))
    }

    /// Convert AWS DateTime to OffsetDateTime.
    fn parse_datetime(dt: &DateTime) -> Result<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
            .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string()))
    }

    async fn head(&self, key: &Path) -> Result<bool> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        match self.client.head_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(err) => Err(sdk_error(err)),
        }
    }

    /// Single-request upload for objects smaller than one part.
    async fn put_whole(&self, full_key: &str, body: Vec<u8>) -> Result<()> {
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(full_key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    /// Multipart upload, starting with an already-read first part.
    async fn put_parts(&self, full_key: &str, first: Vec<u8>, source: &mut Source) -> Result<u64> {
        let upload_id = {
            let _permit = self.acquire_permit().await?;
            let created = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(full_key)
                .send()
                .await
                .map_err(sdk_error)?;
            created
                .upload_id()
                .map(str::to_string)
                .ok_or_raise(|| ErrorKind::BackendError("S3 returned no upload id".to_string()))?
        };
        let result = self.upload_parts(full_key, &upload_id, first, source).await;
        if result.is_err() {
            let _permit = self.acquire_permit().await?;
            let aborted = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(full_key)
                .upload_id(&upload_id)
                .send()
                .await;
            if let Err(err) = aborted {
                tracing::warn!(key = full_key, error = %DisplayErrorContext(&err), "Failed to abort multipart upload");
            }
        }
        result
    }

    async fn upload_parts(&self, full_key: &str, upload_id: &str, first: Vec<u8>, source: &mut Source) -> Result<u64> {
        let mut parts = Vec::new();
        let mut total = 0;
        let mut chunk = first;
        while !chunk.is_empty() {
            let part_number = i32::try_from(parts.len() + 1)
                .or_raise(|| ErrorKind::BackendError("too many upload parts".to_string()))?;
            total += chunk.len() as u64;
            let uploaded = {
                let _permit = self.acquire_permit().await?;
                self.client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(full_key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk))
                    .send()
                    .await
                    .map_err(sdk_error)?
            };
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            tracing::trace!(part_number, "Uploaded part");
            chunk = read_part(source, full_key).await?;
        }
        let _permit = self.acquire_permit().await?;
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(full_key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(total)
    }
}

fn join_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
        None => key.to_string(),
    }
}

fn strip_key<'a>(prefix: Option<&str>, key: &'a str) -> &'a str {
    match prefix {
        Some(prefix) => key.strip_prefix(prefix.trim_end_matches('/')).and_then(|s| s.strip_prefix('/')).unwrap_or(key),
        None => key,
    }
}

/// Read up to one part's worth of bytes. An empty result means end-of-stream.
async fn read_part(source: &mut Source, key: &str) -> Result<Vec<u8>> {
    let mut chunk = Vec::new();
    source.take(PART_SIZE).read_to_end(&mut chunk).await.map_err(|e| ErrorKind::io(e, Path::new(key)))?;
    Ok(chunk)
}

fn sdk_error<E, R>(err: SdkError<E, R>) -> Error
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    let kind = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => ErrorKind::Network(message),
        _ => ErrorKind::BackendError(message),
    };
    exn::Exn::from(kind)
}

#[async_trait]
impl Storage for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, sink), fields(backend = %self.name, key = %key.display()))]
    async fn get(&self, key: &Path, sink: &mut Sink) -> Result<u64> {
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(&full_key).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                exn::bail!(ErrorKind::NotFound(key.to_path_buf()))
            },
            Err(err) => return Err(sdk_error(err)),
        };
        let mut body = output.body;
        let mut read = 0;
        while let Some(bytes) = body.next().await {
            let bytes = bytes.or_raise(|| ErrorKind::Network(format!("body of {full_key} interrupted")))?;
            sink.write_all(&bytes).await.map_err(|e| ErrorKind::io(e, key))?;
            read += bytes.len() as u64;
        }
        sink.flush().await.map_err(|e| ErrorKind::io(e, key))?;
        Ok(read)
    }

    #[tracing::instrument(skip(self, source), fields(backend = %self.name, key = %key.display()))]
    async fn put(&self, key: &Path, source: &mut Source) -> Result<u64> {
        let result = async {
            let full_key = self.full_key(key)?;
            let first = read_part(source, &full_key).await?;
            if (first.len() as u64) < PART_SIZE {
                let size = first.len() as u64;
                self.put_whole(&full_key, first).await?;
                return Ok(size);
            }
            self.put_parts(&full_key, first, source).await
        }
        .await;
        if result.is_err() {
            drain(source).await;
        }
        result
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileEntryStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let key_prefix = match &validated_prefix {
            Some(pfx) => match pfx.to_str() {
                Some(pfx) => Some(join_key(self.prefix.as_deref(), pfx)),
                None => {
                    let err = exn::Exn::from(ErrorKind::InvalidPath(pfx.clone()));
                    return Box::pin(futures::stream::once(async { Result::Err(err) }));
                },
            },
            None => self.prefix.as_deref().map(|p| format!("{}/", p.trim_end_matches('/'))),
        };

        Box::pin(stream! {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(key_prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(sdk_error(err));
                        return;
                    },
                };
                for object in page.contents() {
                    let Some(key) = object.key() else { continue };
                    let relative = match self.relative_path(key) {
                        Ok(relative) => relative,
                        Err(e) => { yield Err(e); continue; },
                    };
                    // S3 prefixes are plain string prefixes; listings are
                    // matched per path component.
                    if let Some(pfx) = &validated_prefix
                        && !relative.starts_with(pfx)
                    {
                        continue;
                    }
                    let modified = match object.last_modified().map(Self::parse_datetime).transpose() {
                        Ok(modified) => modified.unwrap_or(OffsetDateTime::UNIX_EPOCH),
                        Err(e) => { yield Err(e); continue; },
                    };
                    let size = object.size().and_then(|s| u64::try_from(s).ok()).unwrap_or(0);
                    yield Ok(FileEntry::new(relative, size, modified));
                }
            }
        })
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        self.head(key).await
    }

    #[tracing::instrument(skip(self), fields(backend = %self.name, key = %key.display()))]
    async fn delete(&self, key: &Path) -> Result<()> {
        // DeleteObject succeeds on missing keys; check first to report them.
        if !self.head(key).await? {
            exn::bail!(ErrorKind::NotFound(key.to_path_buf()));
        }
        let full_key = self.full_key(key)?;
        let _permit = self.acquire_permit().await?;
        self.client.delete_object().bucket(&self.bucket).key(&full_key).send().await.map_err(sdk_error)?;
        Ok(())
    }
}
