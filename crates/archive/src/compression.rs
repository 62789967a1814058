//! Compression layers for archive streams.
//!
//! Encoders are explicitly finished rather than finished on drop, so that a
//! failure writing the trailer surfaces as an error instead of a silently
//! truncated stream.

#[cfg(feature = "zstd")]
use crate::error::ErrorKind;
use crate::error::Result;
use bzip2::{Compression as BzCompression, read::MultiBzDecoder, write::BzEncoder};
#[cfg(feature = "zstd")]
use exn::ResultExt;
use flate2::{Compression as GzCompression, read::MultiGzDecoder, write::GzEncoder};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::{self, Read, Write};
#[cfg(feature = "xz")]
use xz2::{read::XzDecoder, write::XzEncoder};
#[cfg(feature = "zstd")]
use zstd::stream::{read::Decoder as ZstdDecoder, write::Encoder as ZstdEncoder};

// Caches are rewritten on every build, so favour speed over ratio.
const BZIP2_LEVEL: BzCompression = BzCompression::fast();
const GZIP_LEVEL: GzCompression = GzCompression::new(6);
#[cfg(feature = "xz")]
const XZ_LEVEL: u32 = 6;
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

/// A supported compression layer.
///
/// Variants gated behind feature flags (`xz`, `zstd`) are only available when
/// the corresponding feature is enabled. Defaults to [`None`](Self::None).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Plain tar, no compression layer
    #[default]
    None,
    Bzip2,
    Gzip,
    #[cfg(feature = "xz")]
    Xz,
    #[cfg(feature = "zstd")]
    Zstd,
}

impl Compression {
    /// Returns the short name for configuration (for displaying to user)
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Bzip2 => "bzip2",
            Compression::Gzip => "gzip",
            #[cfg(feature = "xz")]
            Compression::Xz => "xz",
            #[cfg(feature = "zstd")]
            Compression::Zstd => "zstd",
        }
    }

    /// Wrap a writer with this compression layer.
    pub fn encoder<W: Write>(&self, writer: W) -> Result<Encoder<W>> {
        Ok(match self {
            Compression::None => Encoder::None(writer),
            Compression::Bzip2 => Encoder::Bzip2(BzEncoder::new(writer, BZIP2_LEVEL)),
            Compression::Gzip => Encoder::Gzip(GzEncoder::new(writer, GZIP_LEVEL)),
            #[cfg(feature = "xz")]
            Compression::Xz => Encoder::Xz(XzEncoder::new(writer, XZ_LEVEL)),
            #[cfg(feature = "zstd")]
            Compression::Zstd => Encoder::Zstd(ZstdEncoder::new(writer, ZSTD_LEVEL).or_raise(|| ErrorKind::Io)?),
        })
    }

    /// Wrap a reader with the matching decompression layer.
    pub fn decoder<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Compression::None => Box::new(reader),
            Compression::Bzip2 => Box::new(MultiBzDecoder::new(reader)),
            Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
            #[cfg(feature = "xz")]
            Compression::Xz => Box::new(XzDecoder::new(reader)),
            #[cfg(feature = "zstd")]
            Compression::Zstd => Box::new(ZstdDecoder::new(reader).or_raise(|| ErrorKind::StreamCorrupt)?),
        })
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// A writer wrapped in a compression layer.
pub enum Encoder<W: Write> {
    None(W),
    Bzip2(BzEncoder<W>),
    Gzip(GzEncoder<W>),
    #[cfg(feature = "xz")]
    Xz(XzEncoder<W>),
    #[cfg(feature = "zstd")]
    Zstd(ZstdEncoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    /// Write the compression trailer and return the inner writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::None(w) => Ok(w),
            Encoder::Bzip2(e) => e.finish(),
            Encoder::Gzip(e) => e.finish(),
            #[cfg(feature = "xz")]
            Encoder::Xz(e) => e.finish(),
            #[cfg(feature = "zstd")]
            Encoder::Zstd(e) => e.finish(),
        }
    }

    fn inner(&mut self) -> &mut dyn Write {
        match self {
            Encoder::None(w) => w,
            Encoder::Bzip2(e) => e,
            Encoder::Gzip(e) => e,
            #[cfg(feature = "xz")]
            Encoder::Xz(e) => e,
            #[cfg(feature = "zstd")]
            Encoder::Zstd(e) => e,
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn compression_default() {
        assert_eq!(Compression::default(), Compression::None);
    }

    #[rstest]
    #[case(Compression::None)]
    #[case(Compression::Bzip2)]
    #[case(Compression::Gzip)]
    #[cfg_attr(feature = "xz", case(Compression::Xz))]
    #[cfg_attr(feature = "zstd", case(Compression::Zstd))]
    fn test_encoder_finish_then_decode(#[case] format: Compression) {
        let original = b"hello\ngo\n".repeat(100);
        let mut encoder = format.encoder(Vec::new()).unwrap();
        encoder.write_all(&original).unwrap();
        let compressed = encoder.finish().unwrap();
        let mut decoded = Vec::new();
        format.decoder(compressed.as_slice()).unwrap().read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[rstest]
    #[case(Compression::Bzip2)]
    #[case(Compression::Gzip)]
    fn test_invalid_compressed_data(#[case] format: Compression) {
        let mut decoded = Vec::new();
        let result = format.decoder(&b"This is not compressed data"[..]).unwrap().read_to_end(&mut decoded);
        assert!(result.is_err());
    }
}
