//! Lists directory scanner
//!
//! The lists directory is a single flat directory owned by this process for
//! the duration of a run. The scanner records what is currently cached so
//! the resolver can decide what can be reused and what is junk.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::names;

/// One entry of the lists directory, with its decoded name parts.
#[derive(Debug)]
pub struct CachedListFile {
    pub path: PathBuf,
    pub basename: String,
    /// Unescaped `_`-separated fields; empty when the name is unparseable.
    pub parts: Vec<Vec<u8>>,
    pub needed: bool,
    pub deleted: bool,
}

impl CachedListFile {
    /// Delete the file behind this record. Repeated calls are no-ops.
    pub fn delete(&mut self) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        delete_file(&self.path)
            .with_context(|| format!("cannot delete '{}'", self.path.display()))?;
        self.deleted = true;

        Ok(())
    }
}

/// Remove a file, treating an already-missing file as success.
pub fn delete_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Enumerate the lists directory.
///
/// Every entry is a candidate; file types and symbolic links are not
/// distinguished. An unreadable directory is fatal, as is a read error
/// halfway through.
pub fn scan_lists_dir(lists_dir: &Path) -> Result<Vec<CachedListFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(lists_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry
            .with_context(|| format!("cannot read lists directory '{}'", lists_dir.display()))?;
        let basename = entry.file_name().to_string_lossy().to_string();
        let parts = names::parse_basename(&basename).unwrap_or_default();
        files.push(CachedListFile {
            path: entry.path().to_owned(),
            basename,
            parts,
            needed: false,
            deleted: false,
        });
    }

    Ok(files)
}

#[test]
fn test_scan() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("debian_sid_deb_main_amd64_Packages"), b"x").unwrap();
    fs::write(dir.path().join("debian_sid_Release"), b"y").unwrap();
    fs::write(dir.path().join("stray%z"), b"z").unwrap();

    let mut files = scan_lists_dir(dir.path()).unwrap();
    files.sort_by(|a, b| a.basename.cmp(&b.basename));
    assert_eq!(files.len(), 3);
    assert_eq!(files[0].basename, "debian_sid_Release");
    assert_eq!(files[0].parts.len(), 3);
    assert!(!files[0].needed);
    assert!(!files[0].deleted);
    assert_eq!(files[1].parts.last().unwrap(), b"Packages");
    // the malformed escape survives the scan but matches nothing
    assert!(files[2].parts.is_empty());
}

#[test]
fn test_scan_missing_directory_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    assert!(scan_lists_dir(&dir.path().join("nonexistent")).is_err());
}

#[test]
fn test_delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("debian_sid_Release");
    fs::write(&path, b"y").unwrap();

    let mut files = scan_lists_dir(dir.path()).unwrap();
    assert_eq!(files.len(), 1);
    files[0].delete().unwrap();
    assert!(files[0].deleted);
    assert!(!path.exists());
    files[0].delete().unwrap();

    // deleting a file someone else already removed is not an error either
    assert!(delete_file(&path).is_ok());
}
