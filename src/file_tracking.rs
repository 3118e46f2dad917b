//! Source tree enumeration
//!
//! [`SourceScanner`] walks the source root (or its snapshot-mapped equivalent)
//! and streams [`ScanEntry`] values to a visitor as they are discovered, so the
//! pipeline can start hashing before the walk finishes.
//!
//! ## What is emitted
//!
//! - Regular files, as [`SourceFileHandle`]s carrying the read path, the
//!   `/`-separated relative path and the length seen at enumeration time
//! - Directories with no entries at all, so they can be recreated in the
//!   session tree and archive
//!
//! Symbolic links are skipped with a warning unless `follow_symlinks` is set.
//! Unreadable subdirectories are skipped with a warning and counted.
//!
//! ## Exclude patterns
//!
//! Glob patterns (via `globset`) are matched against the relative path. A
//! matching directory prunes its whole subtree.
//!
//! ```rust,ignore
//! let scanner = SourceScanner::new(PathBuf::from("/data/projects"))
//!     .with_exclude_patterns(vec!["**/*.tmp".to_string(), "cache".to_string()])
//!     .with_follow_symlinks(false);
//! let summary = scanner.scan(|entry| {
//!     println!("{}", entry.relative_path());
//!     Ok(())
//! })?;
//! ```

use crate::error::{BackupError, Result};
use crate::fingerprint::SourceFileHandle;
use crate::utils;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// One item discovered in the source tree
#[derive(Debug)]
pub enum ScanEntry {
    /// A regular file
    File(SourceFileHandle),
    /// A directory with no children; relative path
    EmptyDirectory(String),
}

impl ScanEntry {
    /// Relative path of the entry
    pub fn relative_path(&self) -> &str {
        match self {
            ScanEntry::File(handle) => &handle.relative_path,
            ScanEntry::EmptyDirectory(path) => path,
        }
    }
}

/// Totals reported after a walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Regular files emitted
    pub files: u64,
    /// Empty directories emitted
    pub empty_directories: u64,
    /// Bytes across all emitted files
    pub total_bytes: u64,
    /// Entries excluded by pattern
    pub excluded: u64,
    /// Symlinks skipped
    pub symlinks_skipped: u64,
    /// Entries that could not be read
    pub unreadable: u64,
}

/// Enumerates a source tree
#[derive(Debug, Clone)]
pub struct SourceScanner {
    root: PathBuf,
    exclude_patterns: Vec<String>,
    follow_symlinks: bool,
}

impl SourceScanner {
    /// Scanner over `root` with no excludes, not following symlinks
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            exclude_patterns: Vec::new(),
            follow_symlinks: false,
        }
    }

    /// Set exclude glob patterns
    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Set whether symbolic links are followed
    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    fn build_excludes(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.exclude_patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| BackupError::InvalidPattern(format!("{}: {}", pattern, e)))?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| BackupError::InvalidPattern(e.to_string()))
    }

    /// Walk the tree, handing each entry to `visit` in path order
    ///
    /// Stops early and returns the visitor's error if it fails.
    pub fn scan<F>(&self, mut visit: F) -> Result<ScanSummary>
    where
        F: FnMut(ScanEntry) -> Result<()>,
    {
        if !self.root.is_dir() {
            return Err(BackupError::SourceUnavailable(self.root.clone()));
        }
        let excludes = self.build_excludes()?;
        let mut summary = ScanSummary::default();

        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                match entry.path().strip_prefix(&self.root) {
                    Ok(relative) => !excludes.is_match(relative),
                    Err(_) => true,
                }
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    summary.unreadable += 1;
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let relative = match utils::relative_slash_path(entry.path(), &self.root) {
                Ok(relative) => relative,
                Err(e @ BackupError::UnsupportedName(_)) => {
                    warn!("Skipping {:?}: {}", entry.path(), e);
                    summary.unreadable += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let file_type = entry.file_type();

            if file_type.is_symlink() {
                warn!("Skipping symbolic link {}", relative);
                summary.symlinks_skipped += 1;
                continue;
            }

            if file_type.is_dir() {
                if is_empty_dir(entry.path()) {
                    trace!("Empty directory {}", relative);
                    summary.empty_directories += 1;
                    visit(ScanEntry::EmptyDirectory(relative))?;
                }
                continue;
            }

            if !file_type.is_file() {
                debug!("Skipping special file {}", relative);
                continue;
            }

            let length = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!("Cannot stat {}: {}", relative, e);
                    summary.unreadable += 1;
                    continue;
                }
            };
            summary.files += 1;
            summary.total_bytes += length;
            visit(ScanEntry::File(SourceFileHandle::new(
                entry.into_path(),
                relative,
                length,
            )))?;
        }

        summary.excluded = self.count_excluded(&excludes);
        debug!(
            "Scanned {:?}: {} files, {} empty dirs, {} bytes",
            self.root, summary.files, summary.empty_directories, summary.total_bytes
        );
        Ok(summary)
    }

    /// Collect the whole tree into memory
    pub fn collect(&self) -> Result<Vec<ScanEntry>> {
        let mut entries = Vec::new();
        self.scan(|entry| {
            entries.push(entry);
            Ok(())
        })?;
        Ok(entries)
    }

    fn count_excluded(&self, excludes: &GlobSet) -> u64 {
        if excludes.is_empty() {
            return 0;
        }
        // Only top-most excluded entries are counted; pruned subtrees are not walked
        WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(&self.root) {
                Ok(relative) => {
                    let parent_excluded = relative
                        .parent()
                        .map(|p| !p.as_os_str().is_empty() && excludes.is_match(p))
                        .unwrap_or(false);
                    !parent_excluded
                }
                Err(_) => false,
            })
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .map(|relative| excludes.is_match(relative))
                    .unwrap_or(false)
            })
            .count() as u64
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
