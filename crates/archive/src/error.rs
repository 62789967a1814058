//! Archive Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Kinds are [`Clone`] so the cache layer can lift them
//! into its own kinds; the underlying [`std::io::Error`] stays a child in the
//! error tree.

use derive_more::{Display, Error};
use std::path::{Path, PathBuf};

/// An archive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No registered format matches the key's suffix.
    #[display("unrecognized archive format: {_0}")]
    UnrecognizedFormat(#[error(not(source))] String),
    /// A path given to pack does not exist.
    #[display("source not found: {}", _0.display())]
    SourceNotFound(#[error(not(source))] PathBuf),
    /// A path given to pack cannot be stored (escapes its base with `..`).
    #[display("invalid source path: {}", _0.display())]
    InvalidSource(#[error(not(source))] PathBuf),
    /// Input is not a well-formed archive. Don't retry with the same input.
    #[display("corrupt archive stream")]
    StreamCorrupt,
    /// Input ended in the middle of a record.
    #[display("unexpected end of archive stream")]
    UnexpectedEndOfStream,
    /// Reading sources or writing extracted files failed.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Classify an I/O error raised while reading an archive stream.
    pub fn from_read(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEndOfStream,
            // The tar crate reports malformed headers (bad checksums, bad
            // numeric fields) as `Other`.
            std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput | std::io::ErrorKind::Other => {
                Self::StreamCorrupt
            },
            _ => Self::Io,
        }
    }

    /// Classify an I/O error raised while packing `source`.
    pub fn from_pack(err: &std::io::Error, source: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::SourceNotFound(source.to_path_buf()),
            _ => Self::Io,
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io)
    }
}
