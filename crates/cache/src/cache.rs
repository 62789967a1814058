use crate::error::{ErrorKind, Result, Side};
use crate::flusher::{AgeFlusher, Flusher};
use crate::transfer::Transfer;
use exn::ResultExt;
use stash_archive::error::ErrorKind as ArchiveErrorKind;
use stash_archive::{ArchiveHandle, Formats};
use stash_storage::{BackendHandle, FileEntry};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::io::SyncIoBridge;
use tracing::instrument;

/// Which key a best-effort restore extracted, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Restored {
    /// The requested key was extracted.
    Primary,
    /// The requested key failed; the fallback key was extracted instead.
    Fallback,
    /// Nothing was extracted. The build continues without a warm cache.
    Miss,
}

impl Restored {
    pub fn is_hit(&self) -> bool {
        !matches!(self, Restored::Miss)
    }
}

/// Rebuilds, restores and evicts cache archives in one storage backend.
///
/// Holds no state between calls besides its configuration; every operation
/// resolves a fresh archive for the key it works on, so the rebuild target
/// and restore source may use different formats.
///
/// # Examples
///
/// ```no_run
/// use stash_cache::Cache;
/// use stash_storage::backend::LocalBackend;
/// use std::path::{Path, PathBuf};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = Arc::new(LocalBackend::new("local", "/var/cache/stash")?);
/// let cache = Cache::new(storage).with_workdir("/src/project").with_restore_dir("/src/project");
///
/// cache.restore(Path::new("project/feature.tar.gz"), Some(Path::new("project/main.tar.gz"))).await;
/// // ... build ...
/// cache.rebuild(&[PathBuf::from("target")], Path::new("project/feature.tar.gz")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Cache {
    storage: BackendHandle,
    formats: Formats,
    transfer: Transfer,
    /// Rebuild source paths are relative to this directory.
    workdir: PathBuf,
    /// Restore always extracts here.
    restore_dir: PathBuf,
}

impl Cache {
    /// A cache using the built-in archive formats, working in and restoring
    /// to the current directory.
    pub fn new(storage: BackendHandle) -> Self {
        Self {
            storage,
            formats: Formats::default(),
            transfer: Transfer::default(),
            workdir: PathBuf::from("."),
            restore_dir: PathBuf::from("."),
        }
    }

    pub fn with_formats(mut self, formats: Formats) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_transfer(mut self, transfer: Transfer) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_restore_dir(mut self, restore_dir: impl Into<PathBuf>) -> Self {
        self.restore_dir = restore_dir.into();
        self
    }

    fn resolve(&self, key: &Path) -> Result<ArchiveHandle> {
        self.formats.resolve(&key.to_string_lossy()).map_err(|e| ErrorKind::archive(e, ErrorKind::Format))
    }

    /// Pack `sources` and store the archive under `key`, replacing any
    /// existing object.
    ///
    /// The archive format comes from `key`'s suffix; an unrecognised suffix
    /// fails before anything is written. A missing source fails the rebuild
    /// with [`Pack`](ErrorKind::Pack), unless storing the (truncated) archive
    /// failed too, in which case that [`Put`](ErrorKind::Put) error wins.
    #[instrument(skip(self, sources), fields(storage = self.storage.name(), key = %key.display()))]
    pub async fn rebuild(&self, sources: &[PathBuf], key: &Path) -> Result<()> {
        tracing::info!(?sources, "Rebuilding cache");
        let archive = self.resolve(key)?;
        let base = self.workdir.clone();
        let sources = sources.to_vec();
        self.transfer
            .pipe(
                move |sink| async move {
                    let mut sink = SyncIoBridge::new(sink);
                    tokio::task::spawn_blocking(move || archive.pack(&base, &sources, &mut sink))
                        .await
                        .or_raise(|| ErrorKind::Aborted(Side::Produce))?
                        .map_err(|e| ErrorKind::archive(e, ErrorKind::Pack))
                },
                move |mut source| async move {
                    let stored = self.storage.put(key, &mut source).await;
                    let size = stored.map_err(|e| ErrorKind::storage(e, ErrorKind::Put))?;
                    tracing::debug!(bytes = size, "Archive stored");
                    Ok(())
                },
            )
            .await
    }

    /// Extract the archive stored under `key` into the restore directory.
    ///
    /// A single strict attempt: any failure is returned. Files already
    /// extracted when a failure occurs are left in place. If the transfer
    /// times out, this waits for the extraction to stop before returning.
    #[instrument(skip(self), fields(storage = self.storage.name(), key = %key.display()))]
    pub async fn try_restore(&self, key: &Path) -> Result<()> {
        let archive = self.resolve(key)?;
        let storage = self.storage.clone();
        let remote = key.to_path_buf();
        let dest = self.restore_dir.clone();
        let (finished_tx, finished_rx) = oneshot::channel::<()>();
        let result = self
            .transfer
            .pipe(
                move |mut sink| async move {
                    let fetched = storage.get(&remote, &mut sink).await;
                    let size = fetched.map_err(|e| ErrorKind::storage(e, ErrorKind::Get))?;
                    tracing::debug!(bytes = size, "Archive fetched");
                    Ok(())
                },
                move |source| async move {
                    let mut source = SyncIoBridge::new(source);
                    tokio::task::spawn_blocking(move || -> stash_archive::error::Result<()> {
                        let _finished = finished_tx;
                        archive.unpack(&dest, &mut source)?;
                        // Read past the archive's end marker so the producer
                        // never writes into a closed pipe.
                        std::io::copy(&mut source, &mut std::io::sink()).map_err(|e| {
                            let kind = ArchiveErrorKind::from_read(&e);
                            exn::Exn::from(e).raise(kind)
                        })?;
                        Ok(())
                    })
                    .await
                    .or_raise(|| ErrorKind::Aborted(Side::Consume))?
                    .map_err(|e| ErrorKind::archive(e, ErrorKind::Unpack))
                },
            )
            .await;
        // After a timeout the detached unpack keeps running until the aborted
        // download closes its stream.
        _ = finished_rx.await;
        result
    }

    /// Best-effort restore: try `key`, then `fallback` if given, non-empty and
    /// different from `key`.
    ///
    /// Never fails. The outcome is logged and returned so callers can report
    /// it, but a [`Miss`](Restored::Miss) must not stop a build.
    #[instrument(skip(self), fields(storage = self.storage.name(), key = %key.display()))]
    pub async fn restore(&self, key: &Path, fallback: Option<&Path>) -> Restored {
        let primary = match self.try_restore(key).await {
            Ok(()) => {
                tracing::info!("Cache restored");
                return Restored::Primary;
            },
            Err(err) => err,
        };
        let Some(fallback) = fallback.filter(|fallback| !fallback.as_os_str().is_empty() && *fallback != key) else {
            tracing::warn!(error = ?primary, "Cache could not be restored");
            return Restored::Miss;
        };
        tracing::warn!(error = ?primary, fallback = %fallback.display(), "Failed to restore cache; trying fallback");
        match self.try_restore(fallback).await {
            Ok(()) => {
                tracing::info!(fallback = %fallback.display(), "Cache restored from fallback");
                Restored::Fallback
            },
            Err(err) => {
                tracing::warn!(error = ?err, "Cache could not be restored");
                Restored::Miss
            },
        }
    }

    /// Delete entries below `prefix` that have not been modified for
    /// `max_age`. Returns what was deleted.
    pub async fn cleanup(&self, prefix: Option<&Path>, max_age: Duration) -> Result<Vec<FileEntry>> {
        self.cleanup_with(prefix, &AgeFlusher::new(max_age)).await
    }

    /// Delete the entries below `prefix` that `flusher` selects, in listing
    /// order. Stops at the first failed deletion; entries after it are left
    /// for the next run.
    #[instrument(skip(self, flusher), fields(storage = self.storage.name(), prefix = ?prefix))]
    pub async fn cleanup_with(&self, prefix: Option<&Path>, flusher: &dyn Flusher) -> Result<Vec<FileEntry>> {
        tracing::info!("Cleaning cache");
        let entries = self.storage.list(prefix).await.map_err(|e| ErrorKind::storage(e, ErrorKind::List))?;
        let stale = flusher.find(&entries).or_raise(|| ErrorKind::Policy)?;
        for entry in &stale {
            self.storage.delete(&entry.path).await.map_err(|e| ErrorKind::storage(e, ErrorKind::Delete))?;
            tracing::debug!(path = %entry.path.display(), "Evicted");
        }
        tracing::info!(listed = entries.len(), evicted = stale.len(), "Cache cleaned");
        Ok(stale)
    }
}
