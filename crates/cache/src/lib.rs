//! Build cache lifecycle on top of pluggable storage.
//!
//! A [`Cache`] persists a set of paths as a single archive object
//! ([`Cache::rebuild`]), extracts it again ([`Cache::restore`]) and evicts
//! stale objects ([`Cache::cleanup`]). Archives are streamed between the
//! archive codec and the storage backend through a bounded in-memory pipe
//! ([`transfer`]), so they are never held in memory whole.
//!
//! Restoring is best-effort: a missing or corrupt cache must never fail the
//! surrounding build, so [`Cache::restore`] reports its outcome as a
//! [`Restored`] value rather than an error. [`Cache::try_restore`] is the
//! strict single attempt underneath it.

mod cache;
pub mod error;
pub mod flusher;
pub mod transfer;

pub use crate::cache::{Cache, Restored};
pub use crate::flusher::{AgeFlusher, Flusher, NoopFlusher};
pub use crate::transfer::Transfer;
