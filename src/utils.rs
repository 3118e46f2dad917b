//! Utility functions for hlbackup
//!
//! File and path helpers shared by the session store, the target adapters and
//! the verifier:
//!
//! - Atomic writes and copies (temp file, sync, rename)
//! - Relative path normalization to `/`-separated form
//! - Storage identity checks for hard links
//! - Byte formatting for human-readable output

use crate::error::{BackupError, Result};
use crate::fingerprint::{fingerprint_sampled, ContentFingerprint, FingerprintPolicy, HashingReader};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::ffi::{OsStr, OsString};
use std::path::{Component, Path};
use tracing::trace;

const COMPARE_BUFFER_SIZE: usize = 64 * 1024;

/// Atomic file write (write to temp file then rename)
///
/// The target is never observed in a partially written state.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = parent_or_current(path);
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| BackupError::Io(e.error))?;
    Ok(())
}

/// Copy `source` to `destination` through a temp file in the destination
/// directory, then rename it into place
///
/// Fails with `AlreadyExists` if `destination` is present. Returns the
/// fingerprint, under `policy`, of the bytes that were actually written,
/// which can differ from an earlier fingerprint of a live source.
pub fn atomic_copy(
    source: &Path,
    destination: &Path,
    policy: FingerprintPolicy,
) -> io::Result<ContentFingerprint> {
    let parent = parent_or_current(destination);
    let mut input = HashingReader::new(File::open(source)?);
    let mut temp = tempfile::Builder::new()
        .prefix(".hlbackup-")
        .suffix(".partial")
        .tempfile_in(parent)?;
    io::copy(&mut input, temp.as_file_mut())?;
    let length = input.bytes_read();
    let fingerprint = match policy.sample_window(length) {
        Some(window) => fingerprint_sampled(temp.as_file_mut(), length, window)?,
        None => input.fingerprint(),
    };
    temp.as_file().sync_all()?;
    temp.persist_noclobber(destination).map_err(|e| e.error)?;
    trace!("Copied {} bytes to {:?}", length, destination);
    Ok(fingerprint)
}

fn parent_or_current(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Convert `path` to a `/`-separated path relative to `base`
///
/// Each component goes through [`encode_component`], so the result is
/// lossless even for names that are not valid UTF-8.
pub fn relative_slash_path(path: &Path, base: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(base)
        .map_err(|_| BackupError::internal(format!("{:?} is not under {:?}", path, base)))?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(encode_component(part)?),
            Component::CurDir => {}
            other => {
                return Err(BackupError::internal(format!(
                    "unexpected path component {:?} in {:?}",
                    other, relative
                )))
            }
        }
    }
    Ok(parts.join("/"))
}

/// Encode one file name as UTF-8 text that decodes back to the same bytes
///
/// `%` becomes `%25` and every byte outside valid UTF-8 becomes `%XX`.
/// Everything else is kept as is, so ordinary names read naturally.
#[cfg(unix)]
pub fn encode_component(part: &OsStr) -> Result<String> {
    use std::os::unix::ffi::OsStrExt;
    let mut bytes = part.as_bytes();
    let mut encoded = String::with_capacity(bytes.len());
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                push_escaped(&mut encoded, valid);
                return Ok(encoded);
            }
            Err(e) => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                if let Ok(valid) = std::str::from_utf8(valid) {
                    push_escaped(&mut encoded, valid);
                }
                let invalid = e.error_len().unwrap_or(rest.len());
                for byte in &rest[..invalid] {
                    encoded.push_str(&format!("%{:02X}", byte));
                }
                bytes = &rest[invalid..];
            }
        }
    }
}

/// Encode one file name as UTF-8 text that decodes back to the same name
///
/// `%` becomes `%25`. Names that are not valid Unicode are rejected.
#[cfg(not(unix))]
pub fn encode_component(part: &OsStr) -> Result<String> {
    let text = part
        .to_str()
        .ok_or_else(|| BackupError::UnsupportedName(part.to_string_lossy().into_owned()))?;
    let mut encoded = String::with_capacity(text.len());
    push_escaped(&mut encoded, text);
    Ok(encoded)
}

fn push_escaped(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '%' => out.push_str("%25"),
            other => out.push(other),
        }
    }
}

/// Inverse of [`encode_component`]
///
/// A `%` not followed by two hex digits is kept literally.
pub fn decode_component(encoded: &str) -> OsString {
    let raw = encoded.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' && i + 2 < raw.len() {
            if let Some(byte) = hex_pair(raw[i + 1], raw[i + 2]) {
                bytes.push(byte);
                i += 3;
                continue;
            }
        }
        bytes.push(raw[i]);
        i += 1;
    }
    bytes_to_os_string(bytes)
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let digit = |c: u8| (c as char).to_digit(16).map(|d| d as u8);
    Some((digit(high)? << 4) | digit(low)?)
}

#[cfg(unix)]
fn bytes_to_os_string(bytes: Vec<u8>) -> OsString {
    use std::os::unix::ffi::OsStringExt;
    OsString::from_vec(bytes)
}

#[cfg(not(unix))]
fn bytes_to_os_string(bytes: Vec<u8>) -> OsString {
    OsString::from(String::from_utf8_lossy(&bytes).into_owned())
}

/// Whether two paths name the same underlying storage
#[cfg(unix)]
pub fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let (ma, mb) = (fs::metadata(a)?, fs::metadata(b)?);
    Ok(ma.dev() == mb.dev() && ma.ino() == mb.ino())
}

/// Whether two paths name the same underlying storage
#[cfg(not(unix))]
pub fn same_file(a: &Path, b: &Path) -> io::Result<bool> {
    Ok(fs::canonicalize(a)? == fs::canonicalize(b)?)
}

/// Number of directory entries referencing the file
#[cfg(unix)]
pub fn link_count(path: &Path) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(fs::metadata(path)?.nlink())
}

/// Number of directory entries referencing the file
#[cfg(not(unix))]
pub fn link_count(path: &Path) -> io::Result<u64> {
    fs::metadata(path).map(|_| 1)
}

/// Byte-for-byte comparison of two files
pub fn files_identical(a: &Path, b: &Path) -> io::Result<bool> {
    let (fa, fb) = (File::open(a)?, File::open(b)?);
    if fa.metadata()?.len() != fb.metadata()?.len() {
        return Ok(false);
    }

    let mut ra = BufReader::with_capacity(COMPARE_BUFFER_SIZE, fa);
    let mut rb = BufReader::with_capacity(COMPARE_BUFFER_SIZE, fb);
    let mut ba = vec![0u8; COMPARE_BUFFER_SIZE];
    let mut bb = vec![0u8; COMPARE_BUFFER_SIZE];
    loop {
        let na = read_full(&mut ra, &mut ba)?;
        let nb = read_full(&mut rb, &mut bb)?;
        if na != nb || ba[..na] != bb[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
        assert_eq!(format_bytes(1_073_741_824), "1.00 GB");
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("session.json");

        atomic_write(&file_path, b"{}").unwrap();
        atomic_write(&file_path, b"{\"a\":1}").unwrap();

        assert_eq!(fs::read(&file_path).unwrap(), b"{\"a\":1}");
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_atomic_copy_refuses_existing_destination() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("src.txt");
        let dest = temp_dir.path().join("dest.txt");
        fs::write(&source, b"payload").unwrap();

        let copied = atomic_copy(&source, &dest, FingerprintPolicy::Full).unwrap();
        assert_eq!(copied, ContentFingerprint::of_bytes(b"payload"));
        assert_eq!(fs::read(&dest).unwrap(), b"payload");

        let err = atomic_copy(&source, &dest, FingerprintPolicy::Full).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        // No leftover partial files
        let leftovers = fs::read_dir(temp_dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".partial")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_atomic_copy_fingerprints_written_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("large.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
        fs::write(&source, &data).unwrap();

        let policy = FingerprintPolicy::Sampled { threshold: 1024, window: 256 };
        let copied = atomic_copy(&source, &temp_dir.path().join("copy.bin"), policy).unwrap();
        assert_eq!(copied, crate::fingerprint::fingerprint_file(&source, policy).unwrap());
        assert_eq!(copied.length, 50_000);
    }

    #[test]
    fn test_relative_slash_path() {
        let base = Path::new("/data/source");
        let path = base.join("a").join("b.txt");
        assert_eq!(relative_slash_path(&path, base).unwrap(), "a/b.txt");
        assert!(relative_slash_path(Path::new("/elsewhere/x"), base).is_err());
    }

    #[test]
    fn test_component_encoding_escapes_percent() {
        let encoded = encode_component(OsStr::new("50% off.txt")).unwrap();
        assert_eq!(encoded, "50%25 off.txt");
        assert_eq!(decode_component(&encoded), OsString::from("50% off.txt"));
        assert_eq!(encode_component(OsStr::new("żółw.txt")).unwrap(), "żółw.txt");
        // Malformed escapes are taken literally
        assert_eq!(decode_component("a%zz%4"), OsString::from("a%zz%4"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_names_encode_distinctly() {
        use std::os::unix::ffi::OsStrExt;
        let ff = OsStr::from_bytes(b"a\xff");
        let fe = OsStr::from_bytes(b"a\xfe");
        let literal = OsStr::new("a%FF");

        let encoded: Vec<String> = [ff, fe, literal]
            .iter()
            .map(|name| encode_component(name).unwrap())
            .collect();
        assert_eq!(encoded, vec!["a%FF", "a%FE", "a%25FF"]);
        assert_eq!(decode_component(&encoded[0]).as_os_str(), ff);
        assert_eq!(decode_component(&encoded[1]).as_os_str(), fe);
        assert_eq!(decode_component(&encoded[2]).as_os_str(), literal);

        let base = Path::new("/data");
        let path = base.join(OsStr::from_bytes(b"dir\xc3")).join(ff);
        assert_eq!(relative_slash_path(&path, base).unwrap(), "dir%C3/a%FF");
    }

    #[test]
    fn test_files_identical() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        let c = temp_dir.path().join("c");
        fs::write(&a, b"foo").unwrap();
        fs::write(&b, b"foo").unwrap();
        fs::write(&c, b"bar").unwrap();
        assert!(files_identical(&a, &b).unwrap());
        assert!(!files_identical(&a, &c).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_same_file_detects_hard_links() {
        let temp_dir = TempDir::new().unwrap();
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        let c = temp_dir.path().join("c");
        fs::write(&a, b"foo").unwrap();
        fs::hard_link(&a, &b).unwrap();
        fs::write(&c, b"foo").unwrap();
        assert!(same_file(&a, &b).unwrap());
        assert!(!same_file(&a, &c).unwrap());
        assert_eq!(link_count(&a).unwrap(), 2);
    }
}
