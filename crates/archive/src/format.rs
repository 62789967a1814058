//! Archive format resolution from key suffixes.

use crate::compression::Compression;
use crate::error::{ErrorKind, Result};
use crate::tarball::TarArchive;
use crate::ArchiveHandle;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

type Constructor = Arc<dyn Fn() -> ArchiveHandle + Send + Sync>;

/// Ordered table of key suffixes and the archive each one selects.
///
/// Resolution is a pure lookup: every call constructs a fresh archive. When
/// several registered suffixes match a name (say `.gz` and `.tar.gz`), the
/// longest one wins. Matching ignores ASCII case.
///
/// # Examples
///
/// ```
/// use stash_archive::Formats;
///
/// let formats = Formats::default();
/// assert!(formats.resolve("project/main.tar.gz").is_ok());
/// assert!(formats.resolve("project/main.TGZ").is_ok());
/// assert!(formats.resolve("out.ttt").is_err());
/// ```
#[derive(Clone)]
pub struct Formats {
    entries: Vec<(String, Constructor)>,
}

impl Formats {
    /// An empty registry that recognises nothing.
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Register `suffix` (including its leading dot), replacing any previous
    /// registration of the same suffix.
    pub fn register<F>(mut self, suffix: impl Into<String>, constructor: F) -> Self
    where
        F: Fn() -> ArchiveHandle + Send + Sync + 'static,
    {
        let suffix = suffix.into().to_ascii_lowercase();
        self.entries.retain(|(existing, _)| *existing != suffix);
        self.entries.push((suffix, Arc::new(constructor)));
        self
    }

    fn register_tar(self, suffixes: &[&str], compression: Compression) -> Self {
        suffixes.iter().fold(self, |formats, suffix| {
            formats.register(*suffix, move || Box::new(TarArchive::new(compression)) as ArchiveHandle)
        })
    }

    /// Registered suffixes, in registration order.
    pub fn suffixes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(suffix, _)| suffix.as_str())
    }

    /// Construct the archive for a key or file name.
    ///
    /// Fails with [`UnrecognizedFormat`](ErrorKind::UnrecognizedFormat)
    /// naming `name` when no registered suffix matches.
    pub fn resolve(&self, name: &str) -> Result<ArchiveHandle> {
        let lowered = name.to_ascii_lowercase();
        let constructor = self
            .entries
            .iter()
            .filter(|(suffix, _)| lowered.ends_with(suffix.as_str()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, constructor)| constructor);
        match constructor {
            Some(constructor) => Ok((**constructor)()),
            None => exn::bail!(ErrorKind::UnrecognizedFormat(name.to_string())),
        }
    }
}

impl Default for Formats {
    /// Tar, plain and with every enabled compression layer.
    fn default() -> Self {
        let formats = Formats::empty()
            .register_tar(&[".tar"], Compression::None)
            .register_tar(&[".tar.gz", ".tgz"], Compression::Gzip)
            .register_tar(&[".tar.bz2", ".tbz2"], Compression::Bzip2);
        #[cfg(feature = "xz")]
        let formats = formats.register_tar(&[".tar.xz", ".txz"], Compression::Xz);
        #[cfg(feature = "zstd")]
        let formats = formats.register_tar(&[".tar.zst", ".tzst"], Compression::Zstd);
        formats
    }
}

impl Debug for Formats {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_list().entries(self.suffixes()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Archive;
    use rstest::rstest;
    use std::io::{Read, Write};
    use std::path::{Path, PathBuf};

    /// Writes a fixed marker so tests can tell which constructor ran.
    struct Marker(&'static [u8]);

    impl Archive for Marker {
        fn pack(&self, _base: &Path, _sources: &[PathBuf], sink: &mut dyn Write) -> Result<()> {
            sink.write_all(self.0).map_err(|e| exn::Exn::from(e).raise(ErrorKind::Io))
        }

        fn unpack(&self, _dest: &Path, _source: &mut dyn Read) -> Result<()> {
            Ok(())
        }
    }

    fn marker(formats: &Formats, name: &str) -> Vec<u8> {
        let mut sink = Vec::new();
        formats.resolve(name).unwrap().pack(Path::new("."), &[], &mut sink).unwrap();
        sink
    }

    #[rstest]
    #[case("out.tar")]
    #[case("proj/main.tar.gz")]
    #[case("OUT.TGZ")]
    #[case("out.tar.bz2")]
    #[case("out.tbz2")]
    #[cfg_attr(feature = "xz", case("out.tar.xz"))]
    #[cfg_attr(feature = "zstd", case("out.tzst"))]
    fn test_builtin_resolves(#[case] name: &str) {
        assert!(Formats::default().resolve(name).is_ok());
    }

    #[rstest]
    #[case("out.ttt")]
    #[case("out")]
    #[case("out.tar.")]
    #[case("")]
    #[cfg_attr(not(feature = "xz"), case("out.tar.xz"))]
    fn test_unrecognized(#[case] name: &str) {
        let err = Formats::default().resolve(name).err().unwrap();
        assert_eq!(*err, ErrorKind::UnrecognizedFormat(name.to_string()));
    }

    #[test]
    fn test_unrecognized_message_names_key() {
        let err = Formats::default().resolve("out.ttt").err().unwrap();
        assert_eq!((*err).to_string(), "unrecognized archive format: out.ttt");
    }

    #[test]
    fn test_longest_suffix_wins() {
        let formats = Formats::empty()
            .register(".gz", || Box::new(Marker(b"short")) as ArchiveHandle)
            .register(".tar.gz", || Box::new(Marker(b"long")) as ArchiveHandle);
        assert_eq!(marker(&formats, "cache.tar.gz"), b"long");
        assert_eq!(marker(&formats, "cache.gz"), b"short");
    }

    #[test]
    fn test_register_replaces() {
        let formats = Formats::empty()
            .register(".ttt", || Box::new(Marker(b"old")) as ArchiveHandle)
            .register(".TTT", || Box::new(Marker(b"new")) as ArchiveHandle);
        assert_eq!(formats.suffixes().collect::<Vec<_>>(), vec![".ttt"]);
        assert_eq!(marker(&formats, "out.ttt"), b"new");
    }
}
