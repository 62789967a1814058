//! Eviction policies.
//!
//! A [`Flusher`] looks at a storage listing and picks the entries that should
//! be deleted. It never touches storage itself: [`Cache::cleanup_with`]
//! lists, asks the policy, then deletes.
//!
//! [`Cache::cleanup_with`]: crate::Cache::cleanup_with

mod age;
mod noop;

pub use self::age::AgeFlusher;
pub use self::noop::NoopFlusher;
use crate::error::Result;
use stash_storage::FileEntry;

/// Selects the entries of a listing that should be evicted.
///
/// Implementations must not mutate or reorder their input; the selection is
/// returned as copies, in listing order.
///
/// Any `Fn(&FileEntry) -> bool` is a flusher that selects the entries it
/// returns `true` for:
///
/// ```
/// use stash_cache::flusher::Flusher;
/// use stash_storage::FileEntry;
///
/// let large = |entry: &FileEntry| entry.size > 1024 * 1024 * 1024;
/// assert!(large.find(&[]).unwrap().is_empty());
/// ```
pub trait Flusher: Send + Sync {
    fn find(&self, entries: &[FileEntry]) -> Result<Vec<FileEntry>>;
}

impl<F> Flusher for F
where
    F: Fn(&FileEntry) -> bool + Send + Sync,
{
    fn find(&self, entries: &[FileEntry]) -> Result<Vec<FileEntry>> {
        Ok(entries.iter().filter(|&entry| self(entry)).cloned().collect())
    }
}
