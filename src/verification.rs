//! Session verification and integrity checking
//!
//! Checks that a finished session still matches its manifest.
//!
//! ## Overview
//!
//! Verification operates at two levels:
//!
//! 1. **File level**: every manifest entry exists in the session tree with the
//!    recorded length and, when re-hashing is enabled, the recorded digest
//! 2. **Session level**: no unrecorded files sit in the tree, and an archive,
//!    if present, can be read back and holds every manifest entry
//!
//! Hard links share storage, so a corrupted file in one session shows up as a
//! digest mismatch in every session that links to it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use hlbackup::session::SessionStore;
//! use hlbackup::verification::SessionVerifier;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SessionStore::new(PathBuf::from("/backups"));
//! let verifier = SessionVerifier::new().rehash(true);
//! for session in store.load_sessions()? {
//!     let report = verifier.verify(&session)?;
//!     println!("{}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Performance
//!
//! Without re-hashing only metadata is read. With it, every byte of the
//! session is read again (sampled windows for large files under a sampled
//! policy).

use crate::archive;
use crate::collections::{HashMap, HashSet};
use crate::error::Result;
use crate::fingerprint::{self, ContentFingerprint, FingerprintPolicy};
use crate::types::{BackupSession, CommittedFile, ARCHIVE_FILE};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Verifies sessions against their manifests
#[derive(Debug, Clone, Default)]
pub struct SessionVerifier {
    rehash: bool,
}

impl SessionVerifier {
    /// Verifier that checks presence and length only
    pub fn new() -> Self {
        Self::default()
    }

    /// Also recompute every digest
    pub fn rehash(mut self, rehash: bool) -> Self {
        self.rehash = rehash;
        self
    }

    /// Verify one session
    ///
    /// Problems are reported in the result; an `Err` means verification
    /// itself could not run.
    pub fn verify(&self, session: &BackupSession) -> Result<VerificationReport> {
        let start = Instant::now();
        let mut report = VerificationReport::new(session.name.clone());
        report.manifest_entries = session.files.len();

        if session.has_tree {
            debug!("Verifying {} tree entries of {}", session.files.len(), session.name);
            for file in &session.files {
                let check = self.verify_tree_entry(session, file);
                if !check.is_valid() {
                    report
                        .errors
                        .push(format!("File verification failed: {}", file.relative_path));
                }
                report.file_checks.push(check);
            }
            report.orphaned_files = find_orphaned_files(session)?;
        }

        let archive_path = session.root_path.join(ARCHIVE_FILE);
        if archive_path.is_file() {
            self.verify_archive(session, &archive_path, &mut report);
        } else if !session.has_tree && !session.files.is_empty() {
            report
                .errors
                .push(format!("Archive {:?} is missing", archive_path));
        }

        report.total_files_checked = report.file_checks.len();
        report.files_valid = report.file_checks.iter().filter(|f| f.is_valid()).count();
        report.verification_time_ms = start.elapsed().as_millis() as u64;

        info!(
            "Verified session {} in {}ms: {} / {} files valid",
            session.name,
            report.verification_time_ms,
            report.files_valid,
            report.total_files_checked
        );
        Ok(report)
    }

    fn verify_tree_entry(&self, session: &BackupSession, file: &CommittedFile) -> FileVerification {
        let path = session.file_path(&file.relative_path);
        let mut check = FileVerification::new(file.relative_path.clone());

        let metadata = match fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => {
                check.error = Some("not a regular file".to_string());
                return check;
            }
            Err(e) => {
                check.error = Some(e.to_string());
                return check;
            }
        };
        check.exists = true;
        check.size_matches = metadata.len() == file.fingerprint.length;

        if self.rehash && check.size_matches {
            match fingerprint::fingerprint_file(&path, session.policy) {
                Ok(actual) => check.digest_valid = Some(actual == file.fingerprint),
                Err(e) => check.error = Some(format!("cannot hash: {}", e)),
            }
        }
        check
    }

    fn verify_archive(
        &self,
        session: &BackupSession,
        archive_path: &std::path::Path,
        report: &mut VerificationReport,
    ) {
        report.archive_checked = true;
        let entries = match archive::read_archive(archive_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Archive {:?} is unreadable: {}", archive_path, e);
                report.errors.push(format!("Archive unreadable: {}", e));
                return;
            }
        };

        let contents: HashMap<&str, &[u8]> = {
            let mut map = HashMap::with_capacity_and_hasher(entries.len(), Default::default());
            for (name, bytes) in &entries {
                map.insert(name.as_str(), bytes.as_slice());
            }
            map
        };

        let mut archive_valid = true;
        for file in &session.files {
            let mut check = FileVerification::new(file.relative_path.clone());
            match contents.get(file.relative_path.as_str()) {
                Some(bytes) => {
                    check.exists = true;
                    check.size_matches = bytes.len() as u64 == file.fingerprint.length;
                    if self.rehash && check.size_matches && hashes_fully(session.policy, bytes.len() as u64) {
                        check.digest_valid = Some(ContentFingerprint::of_bytes(bytes) == file.fingerprint);
                    }
                }
                None => check.error = Some("not in archive".to_string()),
            }
            if !check.is_valid() {
                archive_valid = false;
                report
                    .errors
                    .push(format!("Archive entry failed: {}", file.relative_path));
            }
            // Tree sessions already counted the file once
            if !session.has_tree {
                report.file_checks.push(check);
            }
        }
        report.archive_valid = archive_valid;
    }
}

fn hashes_fully(policy: FingerprintPolicy, length: u64) -> bool {
    match policy {
        FingerprintPolicy::Full => true,
        FingerprintPolicy::Sampled { threshold, window } => length <= threshold || window == 0,
    }
}

/// Files present in the session tree but absent from the manifest
fn find_orphaned_files(session: &BackupSession) -> Result<Vec<String>> {
    let files_root = session.files_root();
    if !files_root.is_dir() {
        return Ok(Vec::new());
    }
    let recorded: HashSet<&str> = {
        let mut set = HashSet::with_capacity_and_hasher(session.files.len(), Default::default());
        for file in &session.files {
            set.insert(file.relative_path.as_str());
        }
        set
    };

    let mut orphaned = Vec::new();
    for entry in WalkDir::new(&files_root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = utils::relative_slash_path(entry.path(), &files_root)?;
        if !recorded.contains(relative.as_str()) {
            orphaned.push(relative);
        }
    }
    debug!("Found {} orphaned files in {}", orphaned.len(), session.name);
    Ok(orphaned)
}

/// Verification report for a single session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Session directory name
    pub session_name: String,
    /// Entries listed in the manifest
    pub manifest_entries: usize,
    /// Individual file verification results
    pub file_checks: Vec<FileVerification>,
    /// Files in the tree that the manifest does not list
    pub orphaned_files: Vec<String>,
    /// Whether an archive was found and checked
    pub archive_checked: bool,
    /// Whether the archive held every manifest entry intact
    pub archive_valid: bool,
    /// Time taken for verification in milliseconds
    pub verification_time_ms: u64,
    /// Total files checked
    pub total_files_checked: usize,
    /// Number of valid files
    pub files_valid: usize,
    /// List of errors encountered
    pub errors: Vec<String>,
}

impl VerificationReport {
    /// Create an empty report
    pub fn new(session_name: String) -> Self {
        Self {
            session_name,
            manifest_entries: 0,
            file_checks: Vec::new(),
            orphaned_files: Vec::new(),
            archive_checked: false,
            archive_valid: false,
            verification_time_ms: 0,
            total_files_checked: 0,
            files_valid: 0,
            errors: Vec::new(),
        }
    }

    /// Check if the session is fully valid
    ///
    /// Orphaned files do not invalidate a session; they are leftovers of an
    /// interrupted commit and are reported separately.
    pub fn is_valid(&self) -> bool {
        self.files_valid == self.total_files_checked
            && (!self.archive_checked || self.archive_valid)
            && self.errors.is_empty()
    }

    /// Get a summary of the verification
    pub fn summary(&self) -> String {
        if self.is_valid() {
            let orphans = if self.orphaned_files.is_empty() {
                String::new()
            } else {
                format!(", {} unrecorded files", self.orphaned_files.len())
            };
            format!(
                "Session {} is valid ({} files verified in {}ms{})",
                self.session_name, self.total_files_checked, self.verification_time_ms, orphans
            )
        } else {
            let issues = [
                (self.files_valid < self.total_files_checked).then_some("file verification failures"),
                (self.archive_checked && !self.archive_valid).then_some("archive damaged"),
                (self.total_files_checked == 0 && !self.errors.is_empty()).then_some("missing data"),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(", ");

            format!(
                "Session {} is invalid: {} ({}/{} files valid)",
                self.session_name, issues, self.files_valid, self.total_files_checked
            )
        }
    }
}

/// Verification result for a single file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVerification {
    /// Relative path from the manifest
    pub path: String,
    /// Whether the file was found
    pub exists: bool,
    /// Whether the length matches the manifest
    pub size_matches: bool,
    /// Digest comparison; `None` when not re-hashed
    pub digest_valid: Option<bool>,
    /// Error message if verification failed
    pub error: Option<String>,
}

impl FileVerification {
    fn new(path: String) -> Self {
        Self {
            path,
            exists: false,
            size_matches: false,
            digest_valid: None,
            error: None,
        }
    }

    /// Check if the file verification passed
    pub fn is_valid(&self) -> bool {
        self.exists && self.size_matches && self.digest_valid != Some(false) && self.error.is_none()
    }
}
