//! Cache filename encoding for the lists directory
//!
//! Every cached index file is named after the logical fields that requested
//! it, joined with underscores, with an optional type suffix. The escaping
//! is quite harsh so nothing bad can end up in a filename: any byte outside
//! `[A-Za-z0-9-]` becomes `%XX`, and a leading `-` is escaped as well so no
//! filename ever starts with a hyphen.

use std::path::{Path, PathBuf};

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn escape_into(out: &mut String, field: &str) {
    let mut bytes = field.bytes();
    if field.starts_with('-') {
        out.push_str("%2D");
        bytes.next();
    }
    for b in bytes {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0xF) as usize] as char);
        }
    }
}

/// Generate the cache basename for the given type and fields.
pub fn lists_basename(file_type: Option<&str>, fields: &[&str]) -> String {
    let mut name = String::new();
    for field in fields {
        escape_into(&mut name, field);
        name.push('_');
    }
    match file_type {
        Some(file_type) => name.push_str(file_type),
        None => {
            name.pop();
        }
    }

    name
}

/// Generate the full cache path below the lists directory.
pub fn lists_filename(lists_dir: &Path, file_type: Option<&str>, fields: &[&str]) -> PathBuf {
    lists_dir.join(lists_basename(file_type, fields))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode a cache basename back into its raw parts.
///
/// `None` marks a name that does not follow the encoding (a truncated or
/// malformed escape); such files survive in the lists directory but can
/// never match an index.
pub fn parse_basename(basename: &str) -> Option<Vec<Vec<u8>>> {
    let mut parts = Vec::new();
    let mut current = Vec::new();
    let mut bytes = basename.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'_' => parts.push(std::mem::take(&mut current)),
            b'%' => {
                let hi = hex_value(bytes.next()?)?;
                let lo = hex_value(bytes.next()?)?;
                current.push((hi << 4) | lo);
            }
            _ => current.push(b),
        }
    }
    parts.push(current);

    Some(parts)
}

#[test]
fn test_basename_generation() {
    assert_eq!(
        lists_basename(
            Some("Packages"),
            &["debian", "stable", "deb", "main", "amd64"]
        ),
        "debian_stable_deb_main_amd64_Packages"
    );
    assert_eq!(
        lists_basename(Some("Release"), &["debian", "stable"]),
        "debian_stable_Release"
    );
    assert_eq!(lists_basename(None, &["a", "b"]), "a_b");
    // separators and dots inside fields are escaped
    assert_eq!(
        lists_basename(Some("Sources"), &["x_y", "dists/sid"]),
        "x%5Fy_dists%2Fsid_Sources"
    );
    // a leading hyphen would collide with option parsing downstream
    assert_eq!(lists_basename(None, &["-repo"]), "%2Drepo");
    assert_eq!(lists_basename(None, &["re-po"]), "re-po");
}

#[test]
fn test_basename_parsing() {
    let parts = parse_basename("debian_stable_deb_main_amd64_Packages").unwrap();
    assert_eq!(
        parts,
        vec![
            b"debian".to_vec(),
            b"stable".to_vec(),
            b"deb".to_vec(),
            b"main".to_vec(),
            b"amd64".to_vec(),
            b"Packages".to_vec()
        ]
    );
    // both hex cases resolve
    assert_eq!(
        parse_basename("%2Drepo").unwrap(),
        vec![b"-repo".to_vec()]
    );
    assert_eq!(
        parse_basename("%2drepo").unwrap(),
        vec![b"-repo".to_vec()]
    );
    // malformed escapes mark the whole name unparseable
    assert_eq!(parse_basename("a%zz"), None);
    assert_eq!(parse_basename("a%2"), None);
    assert_eq!(parse_basename("a%"), None);
}

#[test]
fn test_roundtrip() {
    let fields = ["weird repo!", "-suite", "comp/one", "100%"];
    let encoded = lists_basename(Some("Packages"), &fields);
    let parts = parse_basename(&encoded).unwrap();
    assert_eq!(parts.len(), fields.len() + 1);
    for (part, field) in parts.iter().zip(fields.iter()) {
        assert_eq!(part, field.as_bytes());
    }
    assert_eq!(parts.last().unwrap(), b"Packages");
}
