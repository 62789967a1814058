//! In-memory storage backend for testing.

use super::{FileEntryStream, Sink, Source, drain};
use crate::error::{ErrorKind, Result};
use crate::models::FileEntry;
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

use crate::Storage;

/// In-memory storage backend for testing.
///
/// Objects are stored in a `HashMap` behind a [`RwLock`], so all trait
/// methods can operate on `&self` without external synchronisation. Like an
/// object store, there are no directories: listings only ever contain files.
///
/// # Examples
///
/// ```
/// use stash_storage::{Storage, backend::MockBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("proj/main.tar", b"archive bytes"),
/// ]);
/// assert!(backend.exists(Path::new("proj/main.tar")).await?);
///
/// let mut source: &[u8] = b"data...";
/// backend.put(Path::new("proj/other.tar"), &mut source).await?;
/// assert!(backend.exists(Path::new("proj/other.tar")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, (OffsetDateTime, Vec<u8>)>>,
    fail_puts: AtomicBool,
}

impl MockBackend {
    /// Create a mock backend pre-populated with objects, all modified "now".
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let now = OffsetDateTime::now_utc();
        let mut backend = Self::empty();
        for (path, data) in files {
            backend = backend.with_entry(path, data, now);
        }
        backend
    }

    fn empty() -> Self {
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(HashMap::new()),
            fail_puts: AtomicBool::new(false),
        }
    }

    /// Add an object with an explicit modification time, for exercising
    /// age-based eviction.
    ///
    /// Panics on an invalid path, like [`with_files`](Self::with_files).
    ///
    /// # Example
    ///
    /// ```
    /// use stash_storage::backend::MockBackend;
    /// use time::{Duration, OffsetDateTime};
    ///
    /// let backend = MockBackend::default()
    ///     .with_entry("proj/old.tar", b"stale", OffsetDateTime::now_utc() - Duration::days(10));
    /// ```
    pub fn with_entry(mut self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>, modified: OffsetDateTime) -> Self {
        let path = path.into();
        let Ok(validated) = validate_path(&path) else {
            // The panic here is DELIBERATE. MockBackend is intended to be
            // used in tests; panics are expected. There is no error result.
            panic!("MockBackend::with_entry: invalid path {}", path.display());
        };
        self.storage.get_mut().insert(validated, (modified, data.into()));
        self
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make every subsequent [`put`](Storage::put) fail after draining its
    /// source, as an unreachable remote would.
    pub fn failing_puts(self) -> Self {
        self.fail_puts.store(true, Ordering::Relaxed);
        self
    }

    /// Raw contents of a stored object, bypassing the streaming interface.
    pub async fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let path = validate_path(path.as_ref()).ok()?;
        self.storage.read().await.get(&path).map(|(_, data)| data.clone())
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        Self::empty()
    }
}

#[async_trait]
impl Storage for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &Path, sink: &mut Sink) -> Result<u64> {
        let path = validate_path(key)?;
        // Clone out of the map so the lock isn't held while the sink applies
        // backpressure.
        let data = self
            .storage
            .read()
            .await
            .get(&path)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        sink.write_all(&data).await.map_err(|e| ErrorKind::io(e, &path))?;
        sink.flush().await.map_err(|e| ErrorKind::io(e, &path))?;
        Ok(data.len() as u64)
    }

    async fn put(&self, key: &Path, source: &mut Source) -> Result<u64> {
        let path = match validate_path(key) {
            Ok(path) => path,
            Err(e) => {
                drain(source).await;
                return Err(e);
            },
        };
        let mut data = Vec::new();
        if let Err(e) = source.read_to_end(&mut data).await {
            drain(source).await;
            return Err(ErrorKind::io(e, &path));
        }
        if self.fail_puts.load(Ordering::Relaxed) {
            exn::bail!(ErrorKind::BackendError(format!("refusing to store {}", path.display())));
        }
        let size = data.len() as u64;
        self.storage.write().await.insert(path, (OffsetDateTime::now_utc(), data));
        Ok(size)
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileEntryStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot matching entries under the read lock, then drop it
            // before yielding to avoid holding the lock across yield points.
            let entries: Vec<FileEntry> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .filter(|(path, _)| match &validated_prefix {
                        Some(pfx) => path.starts_with(pfx),
                        None => true,
                    })
                    .map(|(path, (modified, data))| FileEntry::new(path.clone(), data.len() as u64, *modified))
                    .collect()
            };
            for entry in entries {
                yield Ok(entry);
            }
        })
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        let path = validate_path(key)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn delete(&self, key: &Path) -> Result<()> {
        let path = validate_path(key)?;
        self.storage.write().await.remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }
}
