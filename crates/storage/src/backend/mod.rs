//! Storage backend trait and implementations.
//!
//! This module defines the `Storage` trait, which provides a unified
//! streaming interface across different backends (local filesystem,
//! S3-compatible services, etc.).
//!

mod local;
#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::Result;
use crate::models::FileEntry;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

pub type FileEntryStream<'a> = Pin<Box<dyn Stream<Item = Result<FileEntry>> + Send + 'a>>;
/// Byte stream a backend reads from when storing an object.
pub type Source = dyn AsyncRead + Send + Unpin;
/// Byte stream a backend writes an object's contents into.
pub type Sink = dyn AsyncWrite + Send + Unpin;

/// Unified interface for storage backends.
///
/// Objects are moved in and out as byte streams, never as whole buffers, so
/// a backend can sit at the other end of an in-memory pipe from an archive
/// encoder without the archive ever being resident in memory.
///
/// # Path Handling
/// All keys are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use stash_storage::{Storage, error::Result};
///
/// async fn fetch(backend: &dyn Storage) -> Result<Vec<u8>> {
///     let mut data = Vec::new();
///     backend.get(Path::new("project/main.tar"), &mut data).await?;
///     Ok(data)
/// }
/// ```
#[async_trait]
pub trait Storage: Send + Sync {
    /// Name of the configured backend (used for logging only).
    fn name(&self) -> &str;

    /// Stream the object stored under `key` into `sink`, returning the number
    /// of bytes written.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the key
    /// does not exist. The sink is flushed before returning successfully, but
    /// never shut down: the caller owns it.
    async fn get(&self, key: &Path, sink: &mut Sink) -> Result<u64>;

    /// Store everything read from `source` under `key`, replacing any
    /// existing object, and return the number of bytes stored.
    ///
    /// # Notes
    /// - Implementations **must** read `source` to end-of-stream before
    ///   returning, even when they fail, so a concurrent writer on the other
    ///   end of a pipe is never left blocked. See [`drain`].
    /// - An empty source is not an error; it stores an empty object.
    /// - Implementations should create parent directories as needed.
    async fn put(&self, key: &Path, source: &mut Source) -> Result<u64>;

    /// List all entries matching an optional prefix.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream)
    /// into a [`Vec`], preserving the backend's order.
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<FileEntry>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream entry metadata matching an optional prefix.
    ///
    /// Prefixes are matched per path component: the prefix `proj/main`
    /// matches `proj/main/a.tar` but not `proj/mainline.tar`. The order of
    /// entries is implementation-defined.
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileEntryStream<'a>;

    /// Check if a key exists.
    async fn exists(&self, key: &Path) -> Result<bool>;

    /// Delete a key.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the key
    /// does not exist.
    async fn delete(&self, key: &Path) -> Result<()>;
}

/// Read `source` to end-of-stream, discarding the bytes.
///
/// Used by [`Storage::put`] implementations on their failure paths. Errors
/// while draining are ignored: the source is already being abandoned.
pub async fn drain(source: &mut Source) -> u64 {
    tokio::io::copy(source, &mut tokio::io::sink()).await.unwrap_or(0)
}
