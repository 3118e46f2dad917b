//! Error types for hlbackup
//!
//! Errors fall into three groups that the engine treats differently:
//!
//! - **Startup errors** (`Configuration`, `SourceUnavailable`, `TargetUnwritable`)
//!   abort before any backup work begins.
//! - **Per-file errors** (`Commit`) are logged and counted; the run continues
//!   with the next file.
//! - **Run-fatal errors** (`RemoteUnreachable`, `Persistence`, `Cancelled`)
//!   abort the run after best-effort cleanup.
//!
//! `SnapshotUnavailable` is never fatal: the engine degrades to a live read.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in hlbackup
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for all backup operations
#[derive(Debug, Error)]
pub enum BackupError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Bad or incomplete configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Source root is missing or unreadable
    #[error("Source unavailable: {0:?}")]
    SourceUnavailable(PathBuf),

    /// Target write-access probe failed
    #[error("Target not writable: {path:?} ({reason})")]
    TargetUnwritable {
        /// Target root that failed the probe
        path: PathBuf,
        /// Underlying failure
        reason: String,
    },

    /// Snapshot could not be acquired
    #[error("Snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    /// Remote command channel is unreachable
    #[error("Remote host unreachable: {0}")]
    RemoteUnreachable(String),

    /// A single file failed to commit
    #[error("Failed to commit {path}: {source}")]
    Commit {
        /// Relative path of the file inside the session
        path: String,
        /// Commit failure
        #[source]
        source: CommitError,
    },

    /// Archive write failed
    #[error("Archive error: {0}")]
    ArchiveWrite(String),

    /// Session manifest or metadata could not be persisted
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The run was cancelled (external abort or timeout)
    #[error("Backup cancelled")]
    Cancelled,

    /// Pattern parsing error
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// A source name cannot be represented in the manifest
    #[error("Unsupported file name: {0}")]
    UnsupportedName(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single link or copy against a target
#[derive(Debug, Error)]
pub enum CommitError {
    /// Permission denied at the destination or source
    #[error("permission denied: {0:?}")]
    PermissionDenied(PathBuf),

    /// Source and destination live on different volumes
    #[error("cross-volume link from {from:?} to {to:?}")]
    CrossVolume {
        /// Existing file
        from: PathBuf,
        /// Requested link location
        to: PathBuf,
    },

    /// The link target already has the maximum number of links
    #[error("too many links to {0:?}")]
    TooManyLinks(PathBuf),

    /// Destination path is already present in this session
    #[error("destination already exists: {0:?}")]
    DestinationExists(PathBuf),

    /// Remote host could not be reached
    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    /// Remote command ran but reported failure
    #[error("remote command `{command}` failed ({status}): {stderr}")]
    RemoteCommand {
        /// Command line as issued
        command: String,
        /// Exit status description
        status: String,
        /// Captured standard error
        stderr: String,
    },

    /// Remote link reported success but the destination does not match
    #[error("remote link verification failed for {0:?}")]
    VerificationFailed(PathBuf),

    /// Path cannot be expressed on the remote command line
    #[error("path cannot be passed to the remote host: {0:?}")]
    UnrepresentablePath(PathBuf),

    /// Commit was interrupted by cancellation
    #[error("cancelled")]
    Cancelled,

    /// Any other I/O error
    #[error("{path:?}: {source}")]
    Io {
        /// Path involved in the failure
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

#[cfg(unix)]
const EXDEV: i32 = 18;
#[cfg(unix)]
const EMLINK: i32 = 31;
#[cfg(windows)]
const ERROR_NOT_SAME_DEVICE: i32 = 17;
#[cfg(windows)]
const ERROR_TOO_MANY_LINKS: i32 = 1142;

impl CommitError {
    /// Classify an I/O error raised while linking `from` to `to`
    pub fn from_link_error(err: std::io::Error, from: PathBuf, to: PathBuf) -> Self {
        let code = err.raw_os_error();
        #[cfg(unix)]
        {
            if code == Some(EXDEV) {
                return CommitError::CrossVolume { from, to };
            }
            if code == Some(EMLINK) {
                return CommitError::TooManyLinks(from);
            }
        }
        #[cfg(windows)]
        {
            if code == Some(ERROR_NOT_SAME_DEVICE) {
                return CommitError::CrossVolume { from, to };
            }
            if code == Some(ERROR_TOO_MANY_LINKS) {
                return CommitError::TooManyLinks(from);
            }
        }
        #[cfg(not(any(unix, windows)))]
        let _ = code;

        match err.kind() {
            std::io::ErrorKind::AlreadyExists => CommitError::DestinationExists(to),
            std::io::ErrorKind::PermissionDenied => CommitError::PermissionDenied(to),
            _ => CommitError::Io { path: to, source: err },
        }
    }

    /// Classify an I/O error raised at `path` outside of linking
    pub fn from_io(err: std::io::Error, path: PathBuf) -> Self {
        match err.kind() {
            std::io::ErrorKind::AlreadyExists => CommitError::DestinationExists(path),
            std::io::ErrorKind::PermissionDenied => CommitError::PermissionDenied(path),
            _ => CommitError::Io { path, source: err },
        }
    }

    /// Whether the caller should fall back to a full copy
    pub fn should_copy_instead(&self) -> bool {
        match self {
            CommitError::CrossVolume { .. }
            | CommitError::TooManyLinks(_)
            | CommitError::UnrepresentablePath(_) => true,
            // The candidate vanished from the prior session
            CommitError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Whether this failure means the remote channel is gone
    pub fn is_connectivity_loss(&self) -> bool {
        matches!(self, CommitError::RemoteUnreachable(_))
    }
}

impl BackupError {
    /// Create a configuration error with a custom message
    pub fn configuration(msg: impl Into<String>) -> Self {
        BackupError::Configuration(msg.into())
    }

    /// Create a persistence error with a custom message
    pub fn persistence(msg: impl Into<String>) -> Self {
        BackupError::Persistence(msg.into())
    }

    /// Create an archive error with a custom message
    pub fn archive(msg: impl Into<String>) -> Self {
        BackupError::ArchiveWrite(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        BackupError::Internal(msg.into())
    }

    /// Wrap a commit failure for `path`, promoting connectivity loss and
    /// cancellation to their run-level variants
    pub fn commit(path: impl Into<String>, source: CommitError) -> Self {
        match source {
            CommitError::RemoteUnreachable(msg) => BackupError::RemoteUnreachable(msg),
            CommitError::Cancelled => BackupError::Cancelled,
            source => BackupError::Commit { path: path.into(), source },
        }
    }

    /// Check if this error aborts the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BackupError::Commit { .. }
                | BackupError::SnapshotUnavailable(_)
                | BackupError::ArchiveWrite(_)
                | BackupError::UnsupportedName(_)
        )
    }

    /// Check if this error was raised before any backup work started
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            BackupError::Configuration(_)
                | BackupError::SourceUnavailable(_)
                | BackupError::TargetUnwritable { .. }
                | BackupError::InvalidPattern(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            BackupError::Configuration(msg) => {
                format!("{}. Run with --help to see the accepted arguments.", msg)
            }
            BackupError::SourceUnavailable(path) => {
                format!("Source {:?} does not exist or cannot be read.", path)
            }
            BackupError::TargetUnwritable { path, reason } => {
                format!(
                    "Cannot write to target {:?} ({}). Check that it is mounted and writable.",
                    path, reason
                )
            }
            BackupError::RemoteUnreachable(msg) => {
                format!("Remote host unreachable: {}. Check host, port and credentials.", msg)
            }
            BackupError::Cancelled => "Backup was cancelled; committed files remain valid.".to_string(),
            _ => self.to_string(),
        }
    }
}
