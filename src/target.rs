//! Target adapters
//!
//! One contract, two variants:
//!
//! - [`LocalTarget`]: links with `std::fs::hard_link`. Cross-volume links,
//!   link-count overflow and vanished candidates fall back to a full copy.
//! - [`RemoteShareTarget`]: the target root is a mounted share. Copies go
//!   through the mount, and links are created on the remote host over a
//!   [`RemoteChannel`], then verified through the mount.
//!
//! Copies are atomic: bytes land in a temp file next to the destination, are
//! synced, then renamed into place. A destination is therefore either absent
//! or complete.

use crate::error::{BackupError, CommitError};
use crate::fingerprint::{ContentFingerprint, FingerprintPolicy};
use crate::queue::CancellationToken;
use crate::remote::{RemoteChannel, RemotePathMapper};
use crate::types::join_relative;
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// File written by the write-access probe
pub const PROBE_FILE: &str = "write_access_test.txt";

/// How a file ended up at its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Hard link to existing content
    Linked {
        /// File the link shares storage with
        from: PathBuf,
    },
    /// Full copy of the source bytes
    Copied {
        /// Fingerprint of the bytes written
        fingerprint: ContentFingerprint,
        /// Whether a link was attempted first and fell back
        fell_back: bool,
    },
}

/// Target root on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalTarget {
    root: PathBuf,
}

impl LocalTarget {
    /// Adapter for `root`
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn link(&self, existing: &Path, destination: &Path) -> Result<(), CommitError> {
        fs::hard_link(existing, destination).map_err(|e| {
            CommitError::from_link_error(e, existing.to_path_buf(), destination.to_path_buf())
        })
    }
}

/// Target root mounted from a remote host
#[derive(Clone)]
pub struct RemoteShareTarget {
    share_root: PathBuf,
    mapper: RemotePathMapper,
    channel: Arc<dyn RemoteChannel>,
}

impl std::fmt::Debug for RemoteShareTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteShareTarget")
            .field("share_root", &self.share_root)
            .field("mapper", &self.mapper)
            .finish()
    }
}

impl RemoteShareTarget {
    /// Adapter for a share mounted at `share_root` whose remote path is `remote_root`
    pub fn new(share_root: PathBuf, remote_root: &str, channel: Arc<dyn RemoteChannel>) -> Self {
        Self {
            mapper: RemotePathMapper::new(share_root.clone(), remote_root),
            share_root,
            channel,
        }
    }

    /// Remote command channel
    pub fn channel(&self) -> &Arc<dyn RemoteChannel> {
        &self.channel
    }

    fn link(
        &self,
        existing: &Path,
        destination: &Path,
        expected_length: u64,
        token: &CancellationToken,
    ) -> Result<(), CommitError> {
        if !existing.exists() {
            return Err(CommitError::from_io(
                std::io::Error::new(std::io::ErrorKind::NotFound, "link candidate vanished"),
                existing.to_path_buf(),
            ));
        }
        if destination.exists() {
            return Err(CommitError::DestinationExists(destination.to_path_buf()));
        }

        let remote_existing = self.mapper.to_remote(existing)?;
        let remote_destination = self.mapper.to_remote(destination)?;
        self.channel.link(&remote_existing, &remote_destination, token)?;

        // The share may cache directory listings; confirm through the mount
        match fs::metadata(destination) {
            Ok(meta) if meta.len() == expected_length => Ok(()),
            _ => Err(CommitError::VerificationFailed(destination.to_path_buf())),
        }
    }
}

/// Link-or-copy capability over a target root
#[derive(Debug, Clone)]
pub enum TargetAdapter {
    /// Local filesystem
    Local(LocalTarget),
    /// Share mounted from a remote host
    Remote(RemoteShareTarget),
}

impl TargetAdapter {
    /// Target root as seen locally
    pub fn root(&self) -> &Path {
        match self {
            TargetAdapter::Local(t) => &t.root,
            TargetAdapter::Remote(t) => &t.share_root,
        }
    }

    /// Absolute local path for a path relative to the target root
    pub fn resolve(&self, destination_relative: &str) -> PathBuf {
        join_relative(self.root(), destination_relative)
    }

    /// Check that the remote side is reachable (no-op for local targets)
    pub fn probe_remote(&self, token: &CancellationToken) -> crate::Result<()> {
        match self {
            TargetAdapter::Local(_) => Ok(()),
            TargetAdapter::Remote(t) => t.channel.probe(token).map_err(|e| match e {
                CommitError::RemoteUnreachable(msg) => BackupError::RemoteUnreachable(msg),
                CommitError::Cancelled => BackupError::Cancelled,
                other => BackupError::RemoteUnreachable(other.to_string()),
            }),
        }
    }

    /// Write and delete a marker file under the root
    pub fn probe_write_access(&self) -> crate::Result<()> {
        let root = self.root();
        let unwritable = |e: std::io::Error| BackupError::TargetUnwritable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        };
        fs::create_dir_all(root).map_err(unwritable)?;
        let marker = root.join(PROBE_FILE);
        fs::write(&marker, b"hlbackup write access probe").map_err(unwritable)?;
        fs::remove_file(&marker).map_err(unwritable)?;
        trace!("Write access probe passed for {:?}", root);
        Ok(())
    }

    /// Commit `source` at `destination_relative`
    ///
    /// With `existing`, the destination becomes a hard link to it, falling back
    /// to a copy when linking is impossible. Without it the source is copied,
    /// and the outcome carries the fingerprint of the copied bytes under
    /// `policy`. Parent directories are created as needed.
    pub fn commit(
        &self,
        existing: Option<&Path>,
        source: &Path,
        destination_relative: &str,
        expected_length: u64,
        policy: FingerprintPolicy,
        token: &CancellationToken,
    ) -> Result<CommitOutcome, CommitError> {
        if token.is_cancelled() {
            return Err(CommitError::Cancelled);
        }
        let destination = self.resolve(destination_relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| CommitError::from_io(e, parent.to_path_buf()))?;
        }

        let mut fell_back = false;
        if let Some(existing) = existing {
            let linked = match self {
                TargetAdapter::Local(t) => t.link(existing, &destination),
                TargetAdapter::Remote(t) => t.link(existing, &destination, expected_length, token),
            };
            match linked {
                Ok(()) => {
                    return Ok(CommitOutcome::Linked {
                        from: existing.to_path_buf(),
                    })
                }
                Err(e) if e.should_copy_instead() => {
                    debug!("Link to {:?} not possible ({}); copying", existing, e);
                    fell_back = true;
                }
                Err(e) => return Err(e),
            }
        }

        let fingerprint = utils::atomic_copy(source, &destination, policy)
            .map_err(|e| copy_error(e, source, &destination))?;
        Ok(CommitOutcome::Copied { fingerprint, fell_back })
    }
}

fn copy_error(err: std::io::Error, source: &Path, destination: &Path) -> CommitError {
    match err.kind() {
        std::io::ErrorKind::AlreadyExists => CommitError::DestinationExists(destination.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => CommitError::PermissionDenied(destination.to_path_buf()),
        std::io::ErrorKind::NotFound if !source.exists() => CommitError::Io {
            path: source.to_path_buf(),
            source: err,
        },
        _ => CommitError::Io {
            path: destination.to_path_buf(),
            source: err,
        },
    }
}
