//! Tar archives with an optional compression layer.

use crate::compression::Compression;
use crate::error::{ErrorKind, Result};
use crate::Archive;
use exn::ResultExt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::instrument;

/// Tar streams are made of 512-byte records.
const BLOCK_SIZE: u64 = 512;

/// Tar archive codec.
///
/// Directories are stored recursively and symbolic links are stored as links,
/// never followed, so a restored tree has the same shape as the packed one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TarArchive {
    compression: Compression,
}

impl TarArchive {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

/// Name a source is stored under: the path as given, without any root
/// prefix, and never climbing out of the base with `..`.
fn entry_name(source: &Path) -> Result<PathBuf> {
    let mut name = PathBuf::new();
    for component in source.components() {
        match component {
            Component::Normal(part) => name.push(part),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {},
            Component::ParentDir => exn::bail!(ErrorKind::InvalidSource(source.to_path_buf())),
        }
    }
    Ok(name)
}

/// Reader that remembers how much it delivered and whether it hit
/// end-of-stream, so an archive that stops mid-record can be told apart from
/// one that is malformed.
struct Tracked<R> {
    inner: R,
    consumed: u64,
    eof: bool,
}

impl<R: Read> Tracked<R> {
    fn new(inner: R) -> Self {
        Self { inner, consumed: 0, eof: false }
    }

    fn ended_mid_record(&self) -> bool {
        self.eof && self.consumed % BLOCK_SIZE != 0
    }
}

impl<R: Read> Read for Tracked<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read == 0 && !buf.is_empty() {
            self.eof = true;
        }
        self.consumed += read as u64;
        Ok(read)
    }
}

impl Archive for TarArchive {
    #[instrument(skip(self, sink), fields(compression = %self.compression, base = %base.display()))]
    fn pack(&self, base: &Path, sources: &[PathBuf], sink: &mut dyn Write) -> Result<()> {
        let encoder = self.compression.encoder(sink)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        for source in sources {
            let name = entry_name(source)?;
            let path = base.join(source);
            let metadata = fs::symlink_metadata(&path).map_err(|e| {
                let kind = ErrorKind::from_pack(&e, source);
                exn::Exn::from(e).raise(kind)
            })?;
            tracing::debug!(source = %source.display(), "Packing source");
            let appended = match (metadata.is_dir(), name.as_os_str().is_empty()) {
                (true, true) => builder.append_dir_all(".", &path),
                (true, false) => builder.append_dir_all(&name, &path),
                (false, true) => exn::bail!(ErrorKind::InvalidSource(source.clone())),
                (false, false) => builder.append_path_with_name(&path, &name),
            };
            appended.map_err(|e| {
                let kind = ErrorKind::from_pack(&e, source);
                exn::Exn::from(e).raise(kind)
            })?;
        }
        let encoder = builder.into_inner().or_raise(|| ErrorKind::Io)?;
        encoder.finish().or_raise(|| ErrorKind::Io)?.flush().or_raise(|| ErrorKind::Io)?;
        Ok(())
    }

    #[instrument(skip(self, source), fields(compression = %self.compression, dest = %dest.display()))]
    fn unpack(&self, dest: &Path, source: &mut dyn Read) -> Result<()> {
        fs::create_dir_all(dest).or_raise(|| ErrorKind::Io)?;
        let decoder = self.compression.decoder(source)?;
        let mut archive = tar::Archive::new(Tracked::new(decoder));
        archive.set_overwrite(true);
        archive.set_preserve_permissions(true);
        let unpacked = archive.unpack(dest);
        let tracked = archive.into_inner();
        match unpacked {
            Err(e) => {
                let kind = match tracked.ended_mid_record() {
                    true => ErrorKind::UnexpectedEndOfStream,
                    false => ErrorKind::from_read(&e),
                };
                Err(exn::Exn::from(e).raise(kind))
            },
            Ok(()) if tracked.ended_mid_record() => exn::bail!(ErrorKind::UnexpectedEndOfStream),
            Ok(()) => {
                tracing::debug!(bytes = tracked.consumed, "Archive unpacked");
                Ok(())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::path::Path;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test.txt"), "hello\ngo\n").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        fs::write(dir.path().join("subdir/test2.txt"), "hello2\ngo\n").unwrap();
        dir
    }

    fn pack(archive: &TarArchive, base: &Path, sources: &[&str]) -> Vec<u8> {
        let sources: Vec<PathBuf> = sources.iter().map(PathBuf::from).collect();
        let mut packed = Vec::new();
        archive.pack(base, &sources, &mut packed).unwrap();
        packed
    }

    #[rstest]
    #[case("test.txt", "test.txt")]
    #[case("./subdir/test2.txt", "subdir/test2.txt")]
    #[case("/abs/path", "abs/path")]
    #[case(".", "")]
    fn test_entry_name(#[case] source: &str, #[case] expected: &str) {
        assert_eq!(entry_name(Path::new(source)).unwrap(), Path::new(expected));
    }

    #[test]
    fn test_entry_name_rejects_parent() {
        let err = entry_name(Path::new("../outside")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidSource(_)));
    }

    #[rstest]
    #[case(Compression::None)]
    #[case(Compression::Gzip)]
    #[case(Compression::Bzip2)]
    #[cfg_attr(feature = "xz", case(Compression::Xz))]
    #[cfg_attr(feature = "zstd", case(Compression::Zstd))]
    fn test_pack_unpack(#[case] compression: Compression) {
        let src = fixture();
        let archive = TarArchive::new(compression);
        let packed = pack(&archive, src.path(), &["test.txt", "subdir"]);

        let dest = tempfile::tempdir().unwrap();
        let extracted = dest.path().join("extracted");
        archive.unpack(&extracted, &mut packed.as_slice()).unwrap();
        assert_eq!(fs::read_to_string(extracted.join("test.txt")).unwrap(), "hello\ngo\n");
        assert_eq!(fs::read_to_string(extracted.join("subdir/test2.txt")).unwrap(), "hello2\ngo\n");
    }

    #[test]
    fn test_pack_missing_source() {
        let src = fixture();
        let mut sink = Vec::new();
        let err = TarArchive::default()
            .pack(src.path(), &[PathBuf::from("mount1")], &mut sink)
            .unwrap_err();
        assert_eq!(*err, ErrorKind::SourceNotFound(PathBuf::from("mount1")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_stored_as_link() {
        let src = fixture();
        std::os::unix::fs::symlink("../test.txt", src.path().join("subdir/linkto_test.txt")).unwrap();
        let archive = TarArchive::default();
        let packed = pack(&archive, src.path(), &["test.txt", "subdir"]);

        let dest = tempfile::tempdir().unwrap();
        archive.unpack(dest.path(), &mut packed.as_slice()).unwrap();
        let link = dest.path().join("subdir/linkto_test.txt");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("../test.txt"));
        assert_eq!(fs::read_to_string(&link).unwrap(), "hello\ngo\n");
    }

    #[test]
    fn test_unpack_overwrites() {
        let src = fixture();
        let archive = TarArchive::default();
        let packed = pack(&archive, src.path(), &["test.txt"]);

        let dest = tempfile::tempdir().unwrap();
        fs::write(dest.path().join("test.txt"), "stale").unwrap();
        archive.unpack(dest.path(), &mut packed.as_slice()).unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("test.txt")).unwrap(), "hello\ngo\n");
    }

    #[test]
    fn test_unpack_empty_stream() {
        let dest = tempfile::tempdir().unwrap();
        let mut empty: &[u8] = b"";
        TarArchive::default().unpack(dest.path(), &mut empty).unwrap();
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unpack_truncated_stream() {
        let src = fixture();
        let archive = TarArchive::default();
        let packed = pack(&archive, src.path(), &["test.txt"]);
        // Cut into the middle of the first header block.
        let mut truncated = &packed[..100];
        let dest = tempfile::tempdir().unwrap();
        let err = archive.unpack(dest.path(), &mut truncated).unwrap_err();
        assert_eq!(*err, ErrorKind::UnexpectedEndOfStream);
    }

    #[test]
    fn test_unpack_truncated_file_data() {
        let src = fixture();
        fs::write(src.path().join("big.bin"), vec![7u8; 4096]).unwrap();
        let archive = TarArchive::default();
        let packed = pack(&archive, src.path(), &["big.bin", "test.txt"]);
        let mut truncated = &packed[..512 + 1000];
        let dest = tempfile::tempdir().unwrap();
        let err = archive.unpack(dest.path(), &mut truncated).unwrap_err();
        assert_eq!(*err, ErrorKind::UnexpectedEndOfStream);
    }

    #[test]
    fn test_tracked_reader() {
        let mut tracked = Tracked::new(&b"0123456789"[..]);
        let mut buf = Vec::new();
        tracked.read_to_end(&mut buf).unwrap();
        assert_eq!(tracked.consumed, 10);
        assert!(tracked.eof);
        assert!(tracked.ended_mid_record());
    }

    #[test]
    fn test_unpack_garbage() {
        let dest = tempfile::tempdir().unwrap();
        let mut garbage = &[0x5Au8; 1024][..];
        let err = TarArchive::default().unpack(dest.path(), &mut garbage).unwrap_err();
        assert_eq!(*err, ErrorKind::StreamCorrupt);
    }
}
