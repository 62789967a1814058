//! Cache Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Each kind records *which step* of an operation failed;
//! the collaborator's own kind rides along inside it, and the collaborator's
//! full error tree stays attached as the child.

use derive_more::{Display, Error};
use stash_archive::error::{Error as ArchiveError, ErrorKind as ArchiveErrorKind};
use stash_storage::error::{Error as StorageError, ErrorKind as StorageErrorKind};
use std::time::Duration;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One end of a transfer.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Side {
    /// Writes into the pipe (archive pack, storage get)
    #[display("produce")]
    Produce,
    /// Reads from the pipe (storage put, archive unpack)
    #[display("consume")]
    Consume,
}

/// Actionable error categories.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No archive format matches the key.
    #[display("{_0}")]
    Format(#[error(not(source))] ArchiveErrorKind),
    /// Packing the sources failed.
    #[display("pack failed: {_0}")]
    Pack(#[error(not(source))] ArchiveErrorKind),
    /// Storing the archive failed.
    #[display("upload failed: {_0}")]
    Put(#[error(not(source))] StorageErrorKind),
    /// Fetching the archive failed.
    #[display("download failed: {_0}")]
    Get(#[error(not(source))] StorageErrorKind),
    /// Extracting the archive failed.
    #[display("unpack failed: {_0}")]
    Unpack(#[error(not(source))] ArchiveErrorKind),
    /// Listing entries for eviction failed.
    #[display("listing failed: {_0}")]
    List(#[error(not(source))] StorageErrorKind),
    /// Deleting an evicted entry failed.
    #[display("delete failed: {_0}")]
    Delete(#[error(not(source))] StorageErrorKind),
    /// An eviction policy failed to select entries.
    #[display("eviction policy failed")]
    Policy,
    /// The transfer did not finish within its deadline.
    #[display("transfer timed out after {_0:?}")]
    TimedOut(#[error(not(source))] Duration),
    /// One side of the transfer went away without reporting a result.
    #[display("{_0} side of the transfer aborted")]
    Aborted(#[error(not(source))] Side),
}

impl ErrorKind {
    /// Lift a storage error into the cache step that raised it.
    #[track_caller]
    pub fn storage(err: StorageError, step: fn(StorageErrorKind) -> Self) -> Error {
        let inner = (*err).clone();
        err.raise(step(inner))
    }

    /// Lift an archive error into the cache step that raised it.
    #[track_caller]
    pub fn archive(err: ArchiveError, step: fn(ArchiveErrorKind) -> Self) -> Error {
        let inner = (*err).clone();
        err.raise(step(inner))
    }

    /// The transfer side this error originated on, if it came from a transfer.
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::Pack(_) | Self::Get(_) => Some(Side::Produce),
            Self::Put(_) | Self::Unpack(_) => Some(Side::Consume),
            Self::Aborted(side) => Some(*side),
            Self::Format(_) | Self::List(_) | Self::Delete(_) | Self::Policy | Self::TimedOut(_) => None,
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Put(kind) | Self::Get(kind) | Self::List(kind) | Self::Delete(kind) => kind.is_retryable(),
            Self::Pack(kind) | Self::Unpack(kind) => kind.is_retryable(),
            Self::TimedOut(_) | Self::Aborted(_) => true,
            Self::Format(_) | Self::Policy => false,
        }
    }
}
