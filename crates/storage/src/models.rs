//! Storage models.

use std::path::PathBuf;
use time::OffsetDateTime;

/// What a listed entry is.
///
/// Object stores have no real directories, but filesystem-backed stores do
/// and list them. Eviction policies must be able to tell them apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EntryKind {
    #[default]
    File,
    Directory,
}

/// Metadata of one stored object, as returned by a listing.
///
/// An immutable snapshot; two entries from the same listing are the same
/// object only if their paths are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Key relative to the storage root
    pub path: PathBuf,
    /// Object size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
    pub kind: EntryKind,
}

impl FileEntry {
    /// Create a regular file entry.
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: impl Into<OffsetDateTime>) -> Self {
        Self {
            path: path.into(),
            size,
            modified: modified.into(),
            kind: EntryKind::File,
        }
    }

    /// Create a directory entry.
    pub fn directory(path: impl Into<PathBuf>, modified: impl Into<OffsetDateTime>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            modified: modified.into(),
            kind: EntryKind::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}
