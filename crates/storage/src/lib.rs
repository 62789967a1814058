//! Storage backends for cache archives.
//!
//! A backend only knows how to accept a byte stream under a key, produce it
//! again, list what it holds and delete keys. It knows nothing about what
//! the bytes are; archive encoding lives in `stash-archive`.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::Storage;
pub use crate::models::{EntryKind, FileEntry};
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn Storage + Send + Sync>;
