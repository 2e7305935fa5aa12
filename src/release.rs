//! Release file checksum table parsing

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use nom::bytes::complete::is_not;
use nom::character::complete::{digit1, hex_digit1, space1};
use nom::combinator::map_res;
use nom::IResult;

use crate::checksums::{Checksums, HashAlgorithm};

/// Filenames and checksums advertised by one Release file, in order of
/// first appearance.
#[derive(Debug, Default)]
pub struct FileTable {
    names: Vec<String>,
    checksums: Vec<Checksums>,
    by_name: HashMap<String, usize>,
}

impl FileTable {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    pub fn checksums(&self, index: usize) -> &Checksums {
        &self.checksums[index]
    }

    /// Replace an entry's checksums, e.g. after a test improved them with
    /// additionally computed hashes.
    pub fn set_checksums(&mut self, index: usize, checksums: Checksums) {
        self.checksums[index] = checksums;
    }

    fn add(
        &mut self,
        name: &str,
        algorithm: HashAlgorithm,
        hex: &str,
        size: u64,
    ) -> Result<()> {
        let index = match self.by_name.get(name) {
            Some(index) => *index,
            None => {
                self.names.push(name.to_string());
                self.checksums.push(Checksums::new());
                self.by_name.insert(name.to_string(), self.names.len() - 1);
                self.names.len() - 1
            }
        };
        let checksums = &mut self.checksums[index];
        if let Some(recorded) = checksums.size() {
            if recorded != size {
                bail!(
                    "inconsistent sizes for '{}': {} != {}",
                    name,
                    recorded,
                    size
                );
            }
        }
        if let Some(recorded) = checksums.get(algorithm) {
            if !recorded.eq_ignore_ascii_case(hex) {
                bail!("conflicting {} digests for '{}'", algorithm.name(), name);
            }
        }
        checksums.set_size(size);
        checksums.set(algorithm, hex);

        Ok(())
    }
}

#[inline]
fn checksum_line(input: &str) -> IResult<&str, (&str, u64, &str)> {
    let (input, _) = space1(input)?;
    let (input, hex) = hex_digit1(input)?;
    let (input, _) = space1(input)?;
    let (input, size) = map_res(digit1, str::parse::<u64>)(input)?;
    let (input, _) = space1(input)?;
    let (input, name) = is_not(" \t\r\n")(input)?;

    Ok((input, (hex, size, name)))
}

/// Parse the checksum table out of Release file content.
///
/// Tables of algorithms in `ignore` are discarded during the parse, so
/// their hashes can never force a mismatch later. Entries left with no
/// digest at all are dropped with them.
pub fn parse_checksum_table(
    content: &str,
    ignore: &HashSet<HashAlgorithm>,
) -> Result<FileTable> {
    let mut table = FileTable::default();
    let mut current: Option<HashAlgorithm> = None;
    for line in content.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            let Some(algorithm) = current else {
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            let (_, (hex, size, name)) = checksum_line(line)
                .map_err(|_| anyhow!("malformed checksum line '{}'", line.trim_end()))?;
            if hex.len() != algorithm.hex_len() {
                bail!(
                    "malformed {} digest for '{}' (expected {} hex digits, got {})",
                    algorithm.name(),
                    name,
                    algorithm.hex_len(),
                    hex.len()
                );
            }
            table.add(name, algorithm, hex, size)?;
        } else {
            current = None;
            if let Some(field) = line.strip_suffix(':') {
                if let Some(algorithm) = HashAlgorithm::from_release_field(field) {
                    current = (!ignore.contains(&algorithm)).then_some(algorithm);
                }
            }
        }
    }

    Ok(table)
}

/// Read and parse the checksum table of a locally cached Release file.
pub fn get_checksums(release_path: &Path, ignore: &HashSet<HashAlgorithm>) -> Result<FileTable> {
    let content = fs::read_to_string(release_path)
        .with_context(|| format!("cannot read '{}'", release_path.display()))?;
    parse_checksum_table(&content, ignore)
        .with_context(|| format!("error parsing '{}'", release_path.display()))
}

#[cfg(test)]
const TEST_RELEASE: &str = "Origin: Debian
Suite: stable
Architectures: amd64 arm64
MD5Sum:
 00000000000000000000000000000001 1234 main/binary-amd64/Packages
 00000000000000000000000000000002 567 main/binary-amd64/Packages.gz
SHA256:
 0000000000000000000000000000000000000000000000000000000000000001 1234 main/binary-amd64/Packages
 0000000000000000000000000000000000000000000000000000000000000002 567 main/binary-amd64/Packages.gz
 0000000000000000000000000000000000000000000000000000000000000003 89 main/source/Sources.xz
";

#[test]
fn test_parse_table() {
    let table = parse_checksum_table(TEST_RELEASE, &HashSet::new()).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.name(0), "main/binary-amd64/Packages");
    let checksums = table.checksums(0);
    assert_eq!(checksums.size(), Some(1234));
    assert_eq!(
        checksums.get(HashAlgorithm::Md5),
        Some("00000000000000000000000000000001")
    );
    assert_eq!(
        checksums.get(HashAlgorithm::Sha256),
        Some("0000000000000000000000000000000000000000000000000000000000000001")
    );
    // the Sources entry only appeared in the SHA256 table
    assert_eq!(table.name(2), "main/source/Sources.xz");
    assert_eq!(table.checksums(2).get(HashAlgorithm::Md5), None);
}

#[test]
fn test_ignored_hashes_are_dropped() {
    let mut ignore = HashSet::new();
    ignore.insert(HashAlgorithm::Md5);
    let table = parse_checksum_table(TEST_RELEASE, &ignore).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.checksums(0).get(HashAlgorithm::Md5), None);
    assert!(table.checksums(0).get(HashAlgorithm::Sha256).is_some());

    // an entry whose only table is ignored disappears entirely
    let mut ignore = HashSet::new();
    ignore.insert(HashAlgorithm::Sha256);
    let table = parse_checksum_table(TEST_RELEASE, &ignore).unwrap();
    assert_eq!(table.len(), 2);
}

#[test]
fn test_inconsistent_sizes() {
    let content = "MD5Sum:
 00000000000000000000000000000001 1234 main/binary-amd64/Packages
SHA256:
 0000000000000000000000000000000000000000000000000000000000000001 999 main/binary-amd64/Packages
";
    assert!(parse_checksum_table(content, &HashSet::new()).is_err());
}

#[test]
fn test_malformed_lines() {
    let content = "SHA256:\n not-hex 12 main/binary-amd64/Packages\n";
    assert!(parse_checksum_table(content, &HashSet::new()).is_err());
    // digest length must match the algorithm
    let content = "SHA256:\n abcd 12 main/binary-amd64/Packages\n";
    assert!(parse_checksum_table(content, &HashSet::new()).is_err());
}
