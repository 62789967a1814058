//! Local filesystem storage backend.
//!
//! This module provides a storage backend implementation for the local filesystem.
//! Objects are stored as files below a configured directory and accessed
//! using `tokio::fs` for async I/O.

use crate::backend::{FileEntryStream, Sink, Source, drain};
use crate::error::{Error, ErrorKind};
use crate::{FileEntry, Storage, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::ffi::OsString;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};
use tokio::io::AsyncWriteExt;

/// Suffix of the temporary file an object is streamed into before being
/// renamed into place.
const PARTIAL_SUFFIX: &str = ".partial";

enum WalkEntry {
    File(FileEntry),
    Directory(FileEntry, PathBuf),
    Skip,
}

/// Local filesystem storage backend.
///
/// Stores objects in a directory on the local filesystem. All keys are
/// relative to the configured root directory. Objects are written to a
/// temporary sibling first and renamed into place once fully received, so a
/// failed upload never replaces a good object.
///
/// # Examples
///
/// ```no_run
/// use stash_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/var/cache/stash")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory for stored objects
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Arguments
    /// * `root` - Absolute path to the cache root directory
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists and is not a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it'll only happen once on construction
            // and it's not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| ErrorKind::io(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    /// Get the absolute path for a relative storage key.
    fn absolute_path(&self, key: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(key.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a relative storage key.
    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    /// Temporary path an upload for `absolute` is written to.
    fn partial_path(absolute: &Path) -> PathBuf {
        let mut name = OsString::from(".");
        name.push(absolute.file_name().unwrap_or_default());
        name.push(PARTIAL_SUFFIX);
        absolute.with_file_name(name)
    }

    fn is_partial(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX))
    }

    fn entry(key: PathBuf, metadata: &Metadata) -> Result<FileEntry> {
        let modified = metadata.modified().map_err(|e| ErrorKind::io(e, &key))?;
        Ok(match metadata.is_dir() {
            true => FileEntry::directory(key, modified),
            false => FileEntry::new(key, metadata.len(), modified),
        })
    }

    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        if Self::is_partial(&path) {
            return Ok(WalkEntry::Skip);
        }
        let metadata = entry.metadata().await.map_err(|e| ErrorKind::io(e, &path))?;
        let relative = self.relative_path(&path)?;
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_dir() {
            return Ok(WalkEntry::Directory(Self::entry(relative, &metadata)?, path));
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(Self::entry(relative, &metadata)?));
        }
        // Note: silently drop what is most likely a broken symlink.
        Ok(WalkEntry::Skip)
    }

    /// Stream `source` into a temporary file next to `target`, then rename it
    /// into place. Leaves nothing behind on failure.
    async fn receive(&self, key: &Path, target: &Path, source: &mut Source) -> Result<u64> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::io(e, key))?;
        }
        let partial = PartialFile::new(Self::partial_path(target));
        let mut file = fs::File::create(&partial.path).await.map_err(|e| ErrorKind::io(e, key))?;
        let written = tokio::io::copy(source, &mut file).await.map_err(|e| ErrorKind::io(e, key))?;
        file.flush().await.map_err(|e| ErrorKind::io(e, key))?;
        file.sync_all().await.map_err(|e| ErrorKind::io(e, key))?;
        drop(file);
        fs::rename(&partial.path, target).await.map_err(|e| ErrorKind::io(e, key))?;
        partial.keep();
        Ok(written)
    }
}

/// Removes the temporary upload file when dropped, whether the upload failed
/// or its future was dropped mid-transfer.
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// The file was renamed into place; there is nothing left to remove.
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.armed {
            _ = std::fs::remove_file(&self.path);
        }
    }
}

#[async_trait]
impl Storage for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    #[tracing::instrument(skip(self, sink), fields(backend = %self.name, key = %key.display()))]
    async fn get(&self, key: &Path, sink: &mut Sink) -> Result<u64> {
        let abs_path = self.absolute_path(key)?;
        let mut file = fs::File::open(&abs_path).await.map_err(|e| ErrorKind::io(e, key))?;
        let read = tokio::io::copy(&mut file, sink).await.map_err(|e| ErrorKind::io(e, key))?;
        sink.flush().await.map_err(|e| ErrorKind::io(e, key))?;
        tracing::debug!(bytes = read, "Object streamed out");
        Ok(read)
    }

    #[tracing::instrument(skip(self, source), fields(backend = %self.name, key = %key.display()))]
    async fn put(&self, key: &Path, source: &mut Source) -> Result<u64> {
        let result = match self.absolute_path(key) {
            Ok(target) => self.receive(key, &target, source).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(written) => {
                tracing::debug!(bytes = written, "Object stored");
                Ok(written)
            },
            Err(e) => {
                let discarded = drain(source).await;
                tracing::debug!(discarded, "Upload failed; drained remaining input");
                Err(e)
            },
        }
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileEntryStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };

        let start_dir = validated_prefix
            .as_ref()
            // Walk from the parent directory of the prefix path, so the
            // prefix "proj1/main" starts in "proj1" and matches:
            // - [MATCH] "proj1/main/cache.tar"
            // - [MATCH] "proj1/main" (could be a file or a directory)
            // - [NOT MATCH] "proj1/mainline.tar" (Path::starts_with is component-based)
            .map(|prefix| self.root.join(prefix).parent().unwrap_or(&self.root).to_path_buf())
            .unwrap_or_else(|| self.root.clone());
        let mut stack = vec![start_dir];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Same as S3-compatible backends: listing a prefix that
                    // doesn't exist is an empty list, not an error.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(ErrorKind::io(err, &current));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(ErrorKind::io(e, &current)); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Directory(d, path)) => {
                            stack.push(path);
                            yield Ok(d);
                        },
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, key: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(key)?;
        fs::try_exists(&abs_path).await.map_err(|e| ErrorKind::io(e, key))
    }

    #[tracing::instrument(skip(self), fields(backend = %self.name, key = %key.display()))]
    async fn delete(&self, key: &Path) -> Result<()> {
        let abs_path = self.absolute_path(key)?;
        let metadata = fs::symlink_metadata(&abs_path).await.map_err(|e| ErrorKind::io(e, key))?;
        // Directories only go once they are empty.
        let removed = match metadata.is_dir() {
            true => fs::remove_dir(&abs_path).await,
            false => fs::remove_file(&abs_path).await,
        };
        removed.map_err(|e: std::io::Error| -> Error { ErrorKind::io(e, key) })
    }
}
