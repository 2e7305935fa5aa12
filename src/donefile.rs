//! Done journal for fully processed indices
//!
//! One journal per distribution, recording the cache basename and checksums
//! of every index a previous run finished with. Reading it back in order
//! lets the next run skip indices whose content did not change.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::checksums::Checksums;

/// Reader over the records of a previous run's journal.
pub struct DoneFile {
    lines: Option<Lines<BufReader<File>>>,
}

impl DoneFile {
    /// Open a journal; a missing file simply yields no records.
    pub fn open(path: &Path) -> Result<DoneFile> {
        let lines = match File::open(path) {
            Ok(f) => Some(BufReader::new(f).lines()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("cannot open '{}'", path.display()))
            }
        };

        Ok(DoneFile { lines })
    }

    /// Next `(basename, checksums)` record, in recorded order. A record
    /// that fails to parse ends the sequence.
    pub fn next_index(&mut self) -> Option<(String, Checksums)> {
        let line = self.lines.as_mut()?.next()?.ok()?;
        let (basename, record) = line.split_once(' ')?;
        let checksums = Checksums::parse_record(record)?;

        Some((basename.to_string(), checksums))
    }
}

/// Writer building the next journal. Records are committed as a whole:
/// `finish` atomically replaces the previous journal, an abandoned writer
/// leaves it untouched.
pub struct MarkDoneFile {
    path: PathBuf,
    temp_path: PathBuf,
    writer: BufWriter<File>,
}

impl MarkDoneFile {
    pub fn create(path: &Path) -> Result<MarkDoneFile> {
        let mut temp: OsString = path.as_os_str().to_owned();
        temp.push(".new");
        let temp_path = PathBuf::from(temp);
        let writer = BufWriter::new(
            File::create(&temp_path)
                .with_context(|| format!("cannot create '{}'", temp_path.display()))?,
        );

        Ok(MarkDoneFile {
            path: path.to_owned(),
            temp_path,
            writer,
        })
    }

    pub fn mark_done(&mut self, basename: &str, checksums: &Checksums) -> Result<()> {
        writeln!(self.writer, "{} {}", basename, checksums.to_record())
            .with_context(|| format!("cannot write '{}'", self.temp_path.display()))?;

        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("cannot write '{}'", self.temp_path.display()))?;
        fs::rename(&self.temp_path, &self.path)
            .with_context(|| format!("cannot replace '{}'", self.path.display()))?;

        Ok(())
    }
}

#[test]
fn test_journal_roundtrip() {
    use crate::checksums::HashAlgorithm;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("debian_sid_done");

    let mut checksums = Checksums::new();
    checksums.set_size(4242);
    checksums.set(HashAlgorithm::Sha256, &"ab".repeat(32));

    let mut writer = MarkDoneFile::create(&path).unwrap();
    writer
        .mark_done("debian_sid_deb_main_amd64_Packages", &checksums)
        .unwrap();
    writer
        .mark_done("debian_sid_deb_main_arm64_Packages", &checksums)
        .unwrap();
    writer.finish().unwrap();

    let mut reader = DoneFile::open(&path).unwrap();
    let (basename, recorded) = reader.next_index().unwrap();
    assert_eq!(basename, "debian_sid_deb_main_amd64_Packages");
    assert_eq!(recorded, checksums);
    let (basename, _) = reader.next_index().unwrap();
    assert_eq!(basename, "debian_sid_deb_main_arm64_Packages");
    assert!(reader.next_index().is_none());
}

#[test]
fn test_missing_journal_reads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let mut reader = DoneFile::open(&dir.path().join("debian_sid_done")).unwrap();
    assert!(reader.next_index().is_none());
}

#[test]
fn test_abandoned_writer_keeps_previous_journal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("debian_sid_done");

    let mut writer = MarkDoneFile::create(&path).unwrap();
    writer.mark_done("a", &Checksums::new()).unwrap();
    writer.finish().unwrap();

    let mut writer = MarkDoneFile::create(&path).unwrap();
    writer.mark_done("b", &Checksums::new()).unwrap();
    drop(writer);

    let mut reader = DoneFile::open(&path).unwrap();
    assert_eq!(reader.next_index().unwrap().0, "a");
}
