//! Checksum sets as recorded in Release files and the done journal

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use faster_hex::hex_string;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha256,
        HashAlgorithm::Sha512,
    ];

    /// Field name of this algorithm's table in a Release file.
    pub fn release_field(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5Sum",
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn from_release_field(field: &str) -> Option<HashAlgorithm> {
        HashAlgorithm::ALL
            .into_iter()
            .find(|a| a.release_field() == field)
    }

    /// Short name used in configuration files and journal records.
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn from_name(name: &str) -> Option<HashAlgorithm> {
        HashAlgorithm::ALL.into_iter().find(|a| a.name() == name)
    }

    /// Length of the hex representation of one digest.
    pub fn hex_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
            HashAlgorithm::Sha256 => 64,
            HashAlgorithm::Sha512 => 128,
        }
    }
}

/// Recorded hashes of one file, plus its size when known.
///
/// A set rarely carries every algorithm: Release files advertise whatever
/// the remote side computed, journal records whatever an earlier run knew.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Checksums {
    size: Option<u64>,
    digests: BTreeMap<HashAlgorithm, String>,
}

/// Result of comparing one checksum set against another.
pub struct ChecksumCheck {
    /// No digest (or size) present in both sets disagrees.
    pub matches: bool,
    /// The other set carries information this one lacks.
    pub missing: bool,
}

impl Checksums {
    pub fn new() -> Checksums {
        Checksums::default()
    }

    pub fn set(&mut self, algorithm: HashAlgorithm, hex: &str) {
        self.digests.insert(algorithm, hex.to_ascii_lowercase());
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = Some(size);
    }

    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.digests.get(&algorithm).map(String::as_str)
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn check(&self, other: &Checksums) -> ChecksumCheck {
        let mut matches = true;
        for (algorithm, digest) in &other.digests {
            if let Some(own) = self.digests.get(algorithm) {
                if own != digest {
                    matches = false;
                }
            }
        }
        if let (Some(a), Some(b)) = (self.size, other.size) {
            if a != b {
                matches = false;
            }
        }
        let missing = other
            .digests
            .keys()
            .any(|a| !self.digests.contains_key(a))
            || (self.size.is_none() && other.size.is_some());

        ChecksumCheck { matches, missing }
    }

    /// Union of two sets. Digests of `self` win on overlap, so combining a
    /// trusted set with a merely recorded one never weakens it.
    pub fn combine(&self, other: &Checksums) -> Checksums {
        let mut combined = self.clone();
        for (algorithm, digest) in &other.digests {
            combined
                .digests
                .entry(*algorithm)
                .or_insert_with(|| digest.clone());
        }
        if combined.size.is_none() {
            combined.size = other.size;
        }

        combined
    }

    /// Serialize for a journal record: `size:<n>` followed by
    /// `<algorithm>:<hex>` tokens.
    pub fn to_record(&self) -> String {
        let mut record = String::new();
        if let Some(size) = self.size {
            record.push_str(&format!("size:{}", size));
        }
        for (algorithm, digest) in &self.digests {
            if !record.is_empty() {
                record.push(' ');
            }
            record.push_str(algorithm.name());
            record.push(':');
            record.push_str(digest);
        }

        record
    }

    pub fn parse_record(record: &str) -> Option<Checksums> {
        let mut checksums = Checksums::new();
        for token in record.split_ascii_whitespace() {
            let (key, value) = token.split_once(':')?;
            if key == "size" {
                checksums.size = Some(value.parse().ok()?);
                continue;
            }
            let algorithm = HashAlgorithm::from_name(key)?;
            if value.len() != algorithm.hex_len()
                || !value.bytes().all(|b| b.is_ascii_hexdigit())
            {
                return None;
            }
            checksums.set(algorithm, value);
        }

        Some(checksums)
    }
}

/// Compute every supported hash of a file in one pass.
pub fn hash_file(path: &Path) -> io::Result<Checksums> {
    let mut f = File::open(path)?;
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    let mut size = 0u64;
    let mut buf = [0u8; 65536];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        md5.update(&buf[..n]);
        sha1.update(&buf[..n]);
        sha256.update(&buf[..n]);
        sha512.update(&buf[..n]);
    }

    let mut checksums = Checksums::new();
    checksums.set_size(size);
    checksums.set(HashAlgorithm::Md5, &hex_string(&md5.finalize()));
    checksums.set(HashAlgorithm::Sha1, &hex_string(&sha1.finalize()));
    checksums.set(HashAlgorithm::Sha256, &hex_string(&sha256.finalize()));
    checksums.set(HashAlgorithm::Sha512, &hex_string(&sha512.finalize()));

    Ok(checksums)
}

/// Test a file on disk against recorded checksums.
///
/// `Ok(Some(improved))` on a match; the returned set additionally carries
/// every hash the recorded one was missing, so the caller can store it back
/// and avoid recomputing next time. `Ok(None)` when the content disagrees.
pub fn test_file(path: &Path, expected: &Checksums) -> io::Result<Option<Checksums>> {
    let computed = hash_file(path)?;
    if !computed.check(expected).matches {
        return Ok(None);
    }

    Ok(Some(expected.combine(&computed)))
}

#[test]
fn test_empty_file_hashes() {
    let temp = tempfile::NamedTempFile::new().unwrap();
    let checksums = hash_file(temp.path()).unwrap();
    assert_eq!(checksums.size(), Some(0));
    assert_eq!(
        checksums.get(HashAlgorithm::Md5),
        Some("d41d8cd98f00b204e9800998ecf8427e")
    );
    assert_eq!(
        checksums.get(HashAlgorithm::Sha1),
        Some("da39a3ee5e6b4b0d3255bfef95601890afd80709")
    );
    assert_eq!(
        checksums.get(HashAlgorithm::Sha256),
        Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
    );
}

#[test]
fn test_check_and_combine() {
    let mut a = Checksums::new();
    a.set_size(42);
    a.set(HashAlgorithm::Sha256, "AB".repeat(32).as_str());
    let mut b = Checksums::new();
    b.set(HashAlgorithm::Sha256, "ab".repeat(32).as_str());
    b.set(HashAlgorithm::Md5, &"cd".repeat(16));

    // hex case is normalized away
    let check = a.check(&b);
    assert!(check.matches);
    assert!(check.missing, "a lacks the md5 digest b has");
    let check = b.check(&a);
    assert!(check.matches);
    assert!(check.missing, "b lacks the size a has");

    let combined = a.combine(&b);
    assert_eq!(combined.size(), Some(42));
    assert_eq!(combined.get(HashAlgorithm::Md5), Some("cd".repeat(16).as_str()));
    assert_eq!(
        combined.get(HashAlgorithm::Sha256),
        Some("ab".repeat(32).as_str())
    );

    let mut c = Checksums::new();
    c.set(HashAlgorithm::Sha256, &"ef".repeat(32));
    assert!(!a.check(&c).matches);
}

#[test]
fn test_record_roundtrip() {
    let mut checksums = Checksums::new();
    checksums.set_size(1337);
    checksums.set(HashAlgorithm::Md5, &"ab".repeat(16));
    checksums.set(HashAlgorithm::Sha256, &"cd".repeat(32));
    let record = checksums.to_record();
    assert_eq!(Checksums::parse_record(&record), Some(checksums));

    assert_eq!(Checksums::parse_record("size:abc"), None);
    assert_eq!(Checksums::parse_record("sha256:zz"), None);
    assert_eq!(Checksums::parse_record("notahash:abcd"), None);
}

#[test]
fn test_file_testing() {
    use std::io::Write;

    let mut temp = tempfile::NamedTempFile::new().unwrap();
    temp.write_all(b"Packages say hello").unwrap();
    temp.flush().unwrap();
    let full = hash_file(temp.path()).unwrap();

    let mut expected = Checksums::new();
    expected.set(
        HashAlgorithm::Sha256,
        full.get(HashAlgorithm::Sha256).unwrap(),
    );
    let improved = test_file(temp.path(), &expected).unwrap().unwrap();
    // the match fills in the hashes the Release file did not carry
    assert_eq!(improved, full.combine(&expected));
    assert!(improved.get(HashAlgorithm::Md5).is_some());
    assert_eq!(improved.size(), Some(18));

    let mut wrong = Checksums::new();
    wrong.set(HashAlgorithm::Sha256, &"00".repeat(32));
    assert!(test_file(temp.path(), &wrong).unwrap().is_none());
}
