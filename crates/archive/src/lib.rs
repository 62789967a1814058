//! Archive codecs for build caches.
//!
//! An [`Archive`] turns a set of paths into a single byte stream and back.
//! It only ever sees blocking [`Read`]/[`Write`] handles: where those bytes
//! come from or go to (a storage backend, on the other end of an in-memory
//! pipe) is none of its business.
//!
//! Which archive handles a given cache key is decided by [`Formats`], a
//! suffix table (`.tar`, `.tar.gz`, `.tgz`, ...). Xz and Zstd compression are
//! behind the `xz` and `zstd` feature flags.

mod compression;
pub mod error;
mod format;
mod tarball;

pub use crate::compression::{Compression, Encoder};
pub use crate::format::Formats;
pub use crate::tarball::TarArchive;

use crate::error::Result;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// An archive created by [`Formats::resolve`], ready to be moved onto a
/// blocking thread.
pub type ArchiveHandle = Box<dyn Archive + Send + Sync>;

/// Serialises directory trees to a byte stream and back.
pub trait Archive {
    /// Write every path in `sources` (resolved against `base`) to `sink`, in
    /// order.
    ///
    /// Fails with [`SourceNotFound`](error::ErrorKind::SourceNotFound) if a
    /// source doesn't exist. Bytes already written stay written: the sink
    /// holds a valid prefix of the archive.
    fn pack(&self, base: &Path, sources: &[PathBuf], sink: &mut dyn Write) -> Result<()>;

    /// Extract the archive read from `source` below `dest`, creating `dest`
    /// if needed and overwriting existing files.
    ///
    /// Malformed input fails with
    /// [`StreamCorrupt`](error::ErrorKind::StreamCorrupt), input that stops
    /// in the middle of a record with
    /// [`UnexpectedEndOfStream`](error::ErrorKind::UnexpectedEndOfStream).
    /// Anything after the archive's end marker is left unread.
    fn unpack(&self, dest: &Path, source: &mut dyn Read) -> Result<()>;
}
