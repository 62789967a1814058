//! Key validation.
//!
//! Every key handed to a backend is a relative path below the backend's
//! root. Keys are normalised before use so that `a//b/./c.tar` and
//! `a/b/c.tar` address the same object, and so nothing can climb out of the
//! root with `..`.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates and normalises a storage key.
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Returns
/// Returns the normalized key if valid, or
/// [`InvalidPath`](crate::error::ErrorKind::InvalidPath) if invalid.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use stash_storage::validate_path;
/// assert!(validate_path("project/main.tar.gz").is_ok());
/// assert!(validate_path("project/../other.tar").is_ok()); // (never leaves root)
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert_eq!(
///     validate_path("/project//./branches/../main.tar/").unwrap(),
///     Path::new("project/main.tar")
/// );
/// ```
pub fn validate(key: impl AsRef<Path>) -> Result<PathBuf> {
    let key = key.as_ref();
    let mut components = Vec::new();
    for component in key.components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but
                // truncate in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(key.to_path_buf()));
                }
                components.push(s)
            },
            // Leading slashes are tolerated: keys are always relative to the
            // backend root.
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(key.to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(key.to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(key.to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}
