//! Compression codecs a remote index may be stored in

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;

/// Known codecs, ordered oldest to newest. Download selection takes the
/// *last* codec that is both listed in the Release file and supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Lzma,
    Xz,
    Zstd,
}

impl Compression {
    pub const ALL: [Compression; 6] = [
        Compression::None,
        Compression::Gzip,
        Compression::Bzip2,
        Compression::Lzma,
        Compression::Xz,
        Compression::Zstd,
    ];
    pub const COUNT: usize = Compression::ALL.len();

    /// Filename suffix of this codec; empty for the uncompressed form.
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gzip => ".gz",
            Compression::Bzip2 => ".bz2",
            Compression::Lzma => ".lzma",
            Compression::Xz => ".xz",
            Compression::Zstd => ".zst",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<Compression> {
        Compression::ALL.into_iter().find(|c| c.suffix() == suffix)
    }
}

/// Decompresses stored index variants into their uncompressed form.
pub trait Uncompressor {
    fn supported(&self, compression: Compression) -> bool;

    /// Decompress `from` into `to`, replacing any existing file at `to`.
    fn uncompress(&self, from: &Path, to: &Path, compression: Compression) -> Result<()>;
}

/// In-process codec implementations. `.lzma` is recognized in Release
/// files but carries no decoder here.
pub struct BuiltinUncompressor;

impl Uncompressor for BuiltinUncompressor {
    fn supported(&self, compression: Compression) -> bool {
        !matches!(compression, Compression::Lzma)
    }

    fn uncompress(&self, from: &Path, to: &Path, compression: Compression) -> Result<()> {
        let mut input = BufReader::new(
            File::open(from).with_context(|| format!("cannot open '{}'", from.display()))?,
        );
        let mut output =
            File::create(to).with_context(|| format!("cannot create '{}'", to.display()))?;
        let result = match compression {
            Compression::None => io::copy(&mut input, &mut output),
            Compression::Gzip => io::copy(&mut GzDecoder::new(input), &mut output),
            Compression::Bzip2 => io::copy(&mut bzip2::read::BzDecoder::new(input), &mut output),
            Compression::Xz => io::copy(&mut XzDecoder::new_multi_decoder(input), &mut output),
            Compression::Zstd => io::copy(
                &mut zstd::stream::read::Decoder::new(input)
                    .with_context(|| format!("cannot open '{}'", from.display()))?,
                &mut output,
            ),
            Compression::Lzma => bail!("no decompressor for '.lzma' available"),
        };
        result.with_context(|| {
            format!(
                "error unpacking '{}' into '{}'",
                from.display(),
                to.display()
            )
        })?;

        Ok(())
    }
}

#[test]
fn test_suffixes() {
    assert_eq!(Compression::from_suffix(".gz"), Some(Compression::Gzip));
    assert_eq!(Compression::from_suffix(""), Some(Compression::None));
    assert_eq!(Compression::from_suffix(".zst"), Some(Compression::Zstd));
    assert_eq!(Compression::from_suffix(".tar"), None);
    for c in Compression::ALL {
        assert_eq!(Compression::from_suffix(c.suffix()), Some(c));
    }
}

#[test]
fn test_supported() {
    assert!(BuiltinUncompressor.supported(Compression::Gzip));
    assert!(BuiltinUncompressor.supported(Compression::Zstd));
    assert!(!BuiltinUncompressor.supported(Compression::Lzma));
}

#[test]
fn test_gzip_roundtrip() {
    use flate2::write::GzEncoder;
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let compressed = dir.path().join("Packages.gz");
    let mut encoder = GzEncoder::new(
        File::create(&compressed).unwrap(),
        flate2::Compression::default(),
    );
    encoder.write_all(b"Package: zsync\n").unwrap();
    encoder.finish().unwrap();

    let uncompressed = dir.path().join("Packages");
    BuiltinUncompressor
        .uncompress(&compressed, &uncompressed, Compression::Gzip)
        .unwrap();
    assert_eq!(std::fs::read(&uncompressed).unwrap(), b"Package: zsync\n");
}

#[test]
fn test_zstd_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let compressed = dir.path().join("Sources.zst");
    std::fs::write(&compressed, zstd::encode_all(&b"Source: nala\n"[..], 0).unwrap()).unwrap();

    let uncompressed = dir.path().join("Sources");
    BuiltinUncompressor
        .uncompress(&compressed, &uncompressed, Compression::Zstd)
        .unwrap();
    assert_eq!(std::fs::read(&uncompressed).unwrap(), b"Source: nala\n");
}
