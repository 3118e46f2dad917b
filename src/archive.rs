//! Lazy streaming archive sink
//!
//! [`ArchiveWriter`] produces a tar stream compressed with the LZ4 frame format
//! (`.tar.lz4`). It is an explicit state machine:
//!
//! ```text
//! Unopened --first add_file/add_empty_directory--> Open --close--> Closed
//! ```
//!
//! Construction only records the path. The file, encoder and tar builder are
//! created on the first write, so a writer that is never used leaves nothing
//! on disk.
//!
//! `close` is idempotent and best-effort. It finishes the tar container, then
//! the LZ4 frame, then flushes and syncs the file. If a step fails, the layers
//! below it are still released by drop, and the failure is logged rather than
//! returned, because closing usually happens on cleanup paths. Dropping an
//! open writer closes it.

use crate::error::{BackupError, Result};
use crate::fingerprint::{ContentFingerprint, HashingReader};
use crate::types::join_relative;
use crate::utils;
use lz4_flex::frame::FrameEncoder;
use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

type ArchiveStream = tar::Builder<FrameEncoder<BufWriter<File>>>;

enum ArchiveState {
    Unopened,
    Open(Box<ArchiveStream>),
    Closed,
}

/// Which state the writer is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivePhase {
    /// Nothing written yet; no file exists
    Unopened,
    /// Accepting entries
    Open,
    /// Finished; further writes are rejected
    Closed,
}

/// Compressed tar writer that opens its file on first use
pub struct ArchiveWriter {
    path: PathBuf,
    state: ArchiveState,
    entries: u64,
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("path", &self.path)
            .field("phase", &self.phase())
            .field("entries", &self.entries)
            .finish()
    }
}

impl ArchiveWriter {
    /// Writer for `path`; touches nothing until the first entry
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: ArchiveState::Unopened,
            entries: 0,
        }
    }

    /// Archive location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state
    pub fn phase(&self) -> ArchivePhase {
        match self.state {
            ArchiveState::Unopened => ArchivePhase::Unopened,
            ArchiveState::Open(_) => ArchivePhase::Open,
            ArchiveState::Closed => ArchivePhase::Closed,
        }
    }

    /// Entries written so far
    pub fn entries(&self) -> u64 {
        self.entries
    }

    fn stream(&mut self) -> Result<&mut ArchiveStream> {
        if let ArchiveState::Unopened = self.state {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(&self.path).map_err(|e| {
                BackupError::archive(format!("cannot create {:?}: {}", self.path, e))
            })?;
            let builder = tar::Builder::new(FrameEncoder::new(BufWriter::new(file)));
            debug!("Opened archive {:?}", self.path);
            self.state = ArchiveState::Open(Box::new(builder));
        }

        match &mut self.state {
            ArchiveState::Open(builder) => Ok(builder.as_mut()),
            ArchiveState::Closed => Err(BackupError::archive("archive already closed")),
            ArchiveState::Unopened => Err(BackupError::internal("archive failed to open")),
        }
    }

    /// Add a regular file of `length` bytes read from `content`
    ///
    /// `name` is a recorded relative path and is decoded back to the original
    /// file name. Returns the full-policy fingerprint of the bytes stored. A
    /// stream shorter than `length` fails with `ArchiveWrite`: tar pads the
    /// entry to its declared size, so its content is wrong and the archive
    /// should not be extended further.
    pub fn add_file<R: Read>(&mut self, name: &str, length: u64, content: R) -> Result<ContentFingerprint> {
        let builder = self.stream()?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(length);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        let mut reader = HashingReader::new(content.take(length));
        builder
            .append_data(&mut header, entry_path(name), &mut reader)
            .map_err(|e| BackupError::archive(format!("cannot add {}: {}", name, e)))?;
        if reader.bytes_read() != length {
            return Err(BackupError::archive(format!(
                "{} shrank while being archived ({} of {} bytes)",
                name,
                reader.bytes_read(),
                length
            )));
        }
        self.entries += 1;
        Ok(reader.fingerprint())
    }

    /// Add an empty directory entry
    pub fn add_empty_directory(&mut self, name: &str) -> Result<()> {
        let builder = self.stream()?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        builder
            .append_data(&mut header, entry_path(name), io::empty())
            .map_err(|e| BackupError::archive(format!("cannot add {}/: {}", name, e)))?;
        self.entries += 1;
        Ok(())
    }

    /// Finish the archive; safe to call repeatedly
    pub fn close(&mut self) {
        let builder = match std::mem::replace(&mut self.state, ArchiveState::Closed) {
            ArchiveState::Open(builder) => builder,
            // Never opened: stays artifact-free
            ArchiveState::Unopened | ArchiveState::Closed => return,
        };

        let mut builder = *builder;
        if let Err(e) = builder.finish() {
            warn!("Failed to finalize tar stream {:?}: {}", self.path, e);
        }
        let encoder = match builder.into_inner() {
            Ok(encoder) => encoder,
            Err(e) => {
                warn!("Failed to detach tar stream {:?}: {}", self.path, e);
                return;
            }
        };
        let buffered = match encoder.finish() {
            Ok(buffered) => buffered,
            Err(e) => {
                warn!("Failed to finish lz4 frame {:?}: {}", self.path, e);
                return;
            }
        };
        match buffered.into_inner() {
            Ok(file) => {
                if let Err(e) = file.sync_all() {
                    warn!("Failed to sync archive {:?}: {}", self.path, e);
                }
            }
            Err(e) => warn!("Failed to flush archive {:?}: {}", self.path, e.error()),
        }
        debug!("Closed archive {:?} ({} entries)", self.path, self.entries);
    }
}

fn entry_path(name: &str) -> PathBuf {
    join_relative(Path::new(""), name)
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read every entry of a `.tar.lz4` archive into memory
///
/// Returns `(name, bytes)` pairs in archive order. Names are encoded the same
/// way as manifest paths; directories have empty content and a trailing `/`.
pub fn read_archive(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let file = File::open(path)?;
    let decoder = lz4_flex::frame::FrameDecoder::new(io::BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let mut name = utils::relative_slash_path(&entry.path()?, Path::new(""))?;
        if entry.header().entry_type().is_dir() && !name.ends_with('/') {
            name.push('/');
        }
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        entries.push((name, content));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unused_writer_leaves_no_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("archive.tar.lz4");
        {
            let mut writer = ArchiveWriter::new(path.clone());
            assert_eq!(writer.phase(), ArchivePhase::Unopened);
            writer.close();
            assert_eq!(writer.phase(), ArchivePhase::Unopened);
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_content_round_trips_after_close() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("archive.tar.lz4");
        let big: Vec<u8> = (0..200_000u32).map(|i| (i % 97) as u8).collect();

        let mut writer = ArchiveWriter::new(path.clone());
        let fingerprint = writer.add_file("a.txt", 3, &b"foo"[..]).unwrap();
        assert_eq!(fingerprint, ContentFingerprint::of_bytes(b"foo"));
        writer.add_empty_directory("empty").unwrap();
        writer.add_file("dir/big.bin", big.len() as u64, &big[..]).unwrap();
        assert_eq!(writer.phase(), ArchivePhase::Open);
        writer.close();
        writer.close();
        assert_eq!(writer.phase(), ArchivePhase::Closed);
        assert_eq!(writer.entries(), 3);

        let entries = read_archive(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], ("a.txt".to_string(), b"foo".to_vec()));
        assert_eq!(entries[1], ("empty/".to_string(), Vec::new()));
        assert_eq!(entries[2].0, "dir/big.bin");
        assert_eq!(entries[2].1, big);
    }

    #[test]
    fn test_writes_after_close_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::new(temp_dir.path().join("a.tar.lz4"));
        writer.add_file("a", 1, &b"x"[..]).unwrap();
        writer.close();
        assert!(matches!(
            writer.add_file("b", 1, &b"y"[..]),
            Err(BackupError::ArchiveWrite(_))
        ));
    }

    #[test]
    fn test_short_content_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.tar.lz4");
        let mut writer = ArchiveWriter::new(path);
        let err = writer.add_file("shrunk.txt", 10, &b"abc"[..]).unwrap_err();
        assert!(matches!(err, BackupError::ArchiveWrite(_)), "{:?}", err);
        assert_eq!(writer.entries(), 0);

        // Longer content is cut at the declared length
        let fingerprint = writer.add_file("grown.txt", 3, &b"abcdef"[..]).unwrap();
        assert_eq!(fingerprint, ContentFingerprint::of_bytes(b"abc"));
    }

    #[cfg(unix)]
    #[test]
    fn test_escaped_names_are_stored_as_original_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.tar.lz4");
        let mut writer = ArchiveWriter::new(path.clone());
        writer.add_file("dir/a%FF", 1, &b"x"[..]).unwrap();
        writer.add_file("100%25.txt", 1, &b"y"[..]).unwrap();
        writer.close();

        let file = File::open(&path).unwrap();
        let decoder = lz4_flex::frame::FrameDecoder::new(io::BufReader::new(file));
        let mut archive = tar::Archive::new(decoder);
        let raw: Vec<Vec<u8>> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path_bytes().into_owned())
            .collect();
        assert_eq!(raw, vec![b"dir/a\xff".to_vec(), b"100%.txt".to_vec()]);

        let names: Vec<String> = read_archive(&path).unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["dir/a%FF", "100%25.txt"]);
    }

    #[test]
    fn test_drop_closes_open_writer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a.tar.lz4");
        {
            let mut writer = ArchiveWriter::new(path.clone());
            writer.add_file("only.txt", 4, &b"data"[..]).unwrap();
        }
        let entries = read_archive(&path).unwrap();
        assert_eq!(entries, vec![("only.txt".to_string(), b"data".to_vec())]);
    }
}
