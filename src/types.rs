//! Core data types shared across hlbackup
//!
//! - **Session records**: [`CommittedFile`], [`BackupSession`]
//! - **Configuration**: [`BackupConfig`], [`OutputMode`]
//! - **Run results**: [`BackupStats`], [`BackupReport`], [`EngineState`]

use crate::fingerprint::{ContentFingerprint, FingerprintPolicy};
use crate::remote::RemoteConfig;
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory inside a session that holds the linked/copied tree
pub const SESSION_FILES_DIR: &str = "files";
/// Append-only manifest file inside a session
pub const MANIFEST_FILE: &str = "manifest.jsonl";
/// Session metadata file
pub const SESSION_METADATA_FILE: &str = "session.json";
/// Default archive file name inside a session
pub const ARCHIVE_FILE: &str = "archive.tar.lz4";

/// One file recorded in a session manifest
///
/// Serialized as one JSON object per manifest line:
///
/// ```text
/// {"path":"docs/readme.txt","length":3,"digest":"3f1c..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedFile {
    /// Path relative to the session tree, `/`-separated
    ///
    /// `%` and bytes that are not valid UTF-8 are stored as `%XX` escapes.
    #[serde(rename = "path")]
    pub relative_path: String,
    /// Content fingerprint at commit time
    #[serde(flatten)]
    pub fingerprint: ContentFingerprint,
}

impl CommittedFile {
    /// Create a new record
    pub fn new(relative_path: impl Into<String>, fingerprint: ContentFingerprint) -> Self {
        Self {
            relative_path: relative_path.into(),
            fingerprint,
        }
    }
}

/// A loaded backup session
///
/// Prior sessions are immutable once loaded; the engine only ever reads them.
#[derive(Debug, Clone)]
pub struct BackupSession {
    /// Directory name under the target root
    pub name: String,
    /// Absolute path of the session directory
    pub root_path: PathBuf,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Committed files in manifest order
    pub files: Vec<CommittedFile>,
    /// Whether the session holds a linkable file tree
    pub has_tree: bool,
    /// Fingerprint policy the session was written with
    pub policy: FingerprintPolicy,
}

impl BackupSession {
    /// Root of the session's file tree
    pub fn files_root(&self) -> PathBuf {
        self.root_path.join(SESSION_FILES_DIR)
    }

    /// Absolute path of a committed file
    pub fn file_path(&self, relative_path: &str) -> PathBuf {
        join_relative(&self.files_root(), relative_path)
    }
}

/// Join a `/`-separated relative path onto `base` using native separators
///
/// Components are decoded with [`utils::decode_component`], which restores
/// names that were escaped when recorded.
pub fn join_relative(base: &Path, relative_path: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for part in relative_path.split('/').filter(|p| !p.is_empty()) {
        path.push(utils::decode_component(part));
    }
    path
}

/// What a run writes into the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Hard-linked/copied file tree only
    #[default]
    Tree,
    /// Compressed archive only
    Archive,
    /// Both a tree and an archive
    TreeAndArchive,
}

impl OutputMode {
    /// Whether a file tree is produced
    pub fn writes_tree(&self) -> bool {
        matches!(self, OutputMode::Tree | OutputMode::TreeAndArchive)
    }

    /// Whether an archive is produced
    pub fn writes_archive(&self) -> bool {
        matches!(self, OutputMode::Archive | OutputMode::TreeAndArchive)
    }
}

/// Full configuration of one backup run
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Source root to back up
    pub source: PathBuf,
    /// Target root holding all sessions
    pub target: PathBuf,
    /// Remote link execution, when the target is a mounted share
    pub remote: Option<RemoteConfig>,
    /// Workers per pipeline stage
    pub parallel_workers: usize,
    /// Tree, archive or both
    pub output: OutputMode,
    /// Archive location override (defaults to `archive.tar.lz4` in the session)
    pub archive_path: Option<PathBuf>,
    /// Glob patterns excluded from the source scan
    pub exclude_patterns: Vec<String>,
    /// Fingerprint sampling policy
    pub fingerprint_policy: FingerprintPolicy,
    /// Byte-compare candidates before linking
    pub verify_matches: bool,
    /// Follow symbolic links in the source
    pub follow_symlinks: bool,
    /// Cancel the run after this long
    pub run_timeout: Option<Duration>,
}

impl BackupConfig {
    /// Configuration with defaults for everything but the two roots
    pub fn new(source: PathBuf, target: PathBuf) -> Self {
        Self {
            source,
            target,
            remote: None,
            parallel_workers: num_cpus::get(),
            output: OutputMode::default(),
            archive_path: None,
            exclude_patterns: Vec::new(),
            fingerprint_policy: FingerprintPolicy::default(),
            verify_matches: false,
            follow_symlinks: false,
            run_timeout: None,
        }
    }
}

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Not started
    Idle,
    /// Snapshot attempted (possibly fell back to the live source)
    SnapshotAcquired,
    /// Source files are being enumerated
    Enumerating,
    /// Enumeration finished; remaining files are being committed
    Committing,
    /// All files drained and the session persisted
    Finalized,
    /// Run failed; cleanup attempted
    Aborted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::SnapshotAcquired => "snapshot-acquired",
            EngineState::Enumerating => "enumerating",
            EngineState::Committing => "committing",
            EngineState::Finalized => "finalized",
            EngineState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStats {
    /// Regular files enumerated
    pub files_seen: u64,
    /// Files committed as hard links
    pub files_linked: u64,
    /// Files committed as full copies
    pub files_copied: u64,
    /// Files written to the archive
    pub files_archived: u64,
    /// Files that failed and were skipped
    pub files_failed: u64,
    /// Bytes written by copies
    pub bytes_copied: u64,
    /// Bytes saved by links
    pub bytes_linked: u64,
    /// Empty directories recreated
    pub directories_created: u64,
}

impl BackupStats {
    /// Files that made it into the session
    pub fn files_committed(&self) -> u64 {
        self.files_linked + self.files_copied
    }
}

/// Result of a finished backup run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    /// Session id
    pub session_id: String,
    /// Session directory name
    pub session_name: String,
    /// Absolute session directory
    pub session_dir: PathBuf,
    /// Final engine state
    pub state: EngineState,
    /// Counters
    pub stats: BackupStats,
    /// Whether the source was read through a snapshot
    pub snapshot_used: bool,
    /// Archive path, if one was written
    pub archive_path: Option<PathBuf>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Non-fatal problems encountered
    pub warnings: Vec<String>,
}
