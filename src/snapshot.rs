//! Point-in-time source snapshots
//!
//! A [`SnapshotProvider`] tries to produce a read-only view of the volume that
//! holds the source tree. When it succeeds, the engine reads every source byte
//! through [`SnapshotHandle::map_path`], so concurrent edits to the live tree
//! cannot tear a file mid-read. When it fails, the engine logs a warning and
//! reads the live tree instead; snapshots are an improvement, never a
//! requirement.
//!
//! A handle releases its underlying resource exactly once: either through
//! [`SnapshotHandle::release`] or, failing that, when it is dropped.

use crate::error::{BackupError, Result};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Releases the resource behind a snapshot
pub trait SnapshotRelease: Send + Sync {
    /// Tear the snapshot down; called at most once
    fn release(&self) -> Result<()>;
}

impl<F> SnapshotRelease for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn release(&self) -> Result<()> {
        self()
    }
}

/// A live snapshot of one volume
pub struct SnapshotHandle {
    original_root: PathBuf,
    snapshot_root: PathBuf,
    releaser: Box<dyn SnapshotRelease>,
    released: AtomicBool,
}

impl fmt::Debug for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotHandle")
            .field("original_root", &self.original_root)
            .field("snapshot_root", &self.snapshot_root)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl SnapshotHandle {
    /// Wrap a snapshot of `original_root` visible at `snapshot_root`
    pub fn new(
        original_root: PathBuf,
        snapshot_root: PathBuf,
        releaser: impl SnapshotRelease + 'static,
    ) -> Self {
        Self {
            original_root,
            snapshot_root,
            releaser: Box::new(releaser),
            released: AtomicBool::new(false),
        }
    }

    /// Volume root the snapshot was taken of
    pub fn original_root(&self) -> &Path {
        &self.original_root
    }

    /// Where the snapshot is mounted
    pub fn snapshot_root(&self) -> &Path {
        &self.snapshot_root
    }

    /// Translate a live path into the snapshot
    ///
    /// Paths outside the snapshotted volume are returned unchanged.
    pub fn map_path(&self, original: &Path) -> PathBuf {
        match original.strip_prefix(&self.original_root) {
            Ok(rest) if rest.as_os_str().is_empty() => self.snapshot_root.clone(),
            Ok(rest) => self.snapshot_root.join(rest),
            Err(_) => original.to_path_buf(),
        }
    }

    /// Release the snapshot now and report failures
    pub fn release(self) -> Result<()> {
        self.release_once()
    }

    fn release_once(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Releasing snapshot {:?}", self.snapshot_root);
        self.releaser.release()
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_once() {
            warn!("Failed to release snapshot {:?}: {}", self.snapshot_root, e);
        }
    }
}

/// Source of point-in-time volume views
pub trait SnapshotProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Snapshot the volume mounted at `volume_root`
    ///
    /// Errors are reported as [`BackupError::SnapshotUnavailable`]; the caller
    /// degrades to live reads.
    fn try_create_snapshot(&self, volume_root: &Path) -> Result<SnapshotHandle>;
}

/// Provider that never snapshots; the engine reads the live tree
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSnapshot;

impl SnapshotProvider for NoSnapshot {
    fn name(&self) -> &str {
        "none"
    }

    fn try_create_snapshot(&self, _volume_root: &Path) -> Result<SnapshotHandle> {
        Err(BackupError::SnapshotUnavailable(
            "snapshots disabled".to_string(),
        ))
    }
}

/// Read-only btrfs subvolume snapshots
///
/// Runs `btrfs subvolume snapshot -r <volume> <volume>/.hlbackup-snapshot-<id>`
/// and deletes the subvolume on release. Requires the source volume to be a
/// btrfs subvolume and enough privilege to create snapshots.
#[derive(Debug, Clone)]
pub struct BtrfsSnapshotProvider {
    program: PathBuf,
}

impl Default for BtrfsSnapshotProvider {
    fn default() -> Self {
        Self {
            program: PathBuf::from("btrfs"),
        }
    }
}

impl BtrfsSnapshotProvider {
    /// Use a specific `btrfs` binary
    pub fn with_program(program: PathBuf) -> Self {
        Self { program }
    }
}

fn run_btrfs(program: &Path, args: &[&OsStr]) -> std::result::Result<(), String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| format!("cannot run {:?}: {}", program, e))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "{:?} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

impl SnapshotProvider for BtrfsSnapshotProvider {
    fn name(&self) -> &str {
        "btrfs"
    }

    fn try_create_snapshot(&self, volume_root: &Path) -> Result<SnapshotHandle> {
        let snapshot_root = volume_root.join(format!(
            ".hlbackup-snapshot-{}",
            uuid::Uuid::new_v4().simple()
        ));

        let created = run_btrfs(
            &self.program,
            &[
                OsStr::new("subvolume"),
                OsStr::new("snapshot"),
                OsStr::new("-r"),
                volume_root.as_os_str(),
                snapshot_root.as_os_str(),
            ],
        );
        if let Err(reason) = created {
            // A partially created subvolume must not outlive the attempt
            if snapshot_root.exists() {
                let _ = run_btrfs(
                    &self.program,
                    &[OsStr::new("subvolume"), OsStr::new("delete"), snapshot_root.as_os_str()],
                );
            }
            return Err(BackupError::SnapshotUnavailable(reason));
        }

        info!("Created btrfs snapshot {:?}", snapshot_root);
        let program = self.program.clone();
        let to_delete = snapshot_root.clone();
        Ok(SnapshotHandle::new(
            volume_root.to_path_buf(),
            snapshot_root,
            move || {
                run_btrfs(
                    &program,
                    &[OsStr::new("subvolume"), OsStr::new("delete"), to_delete.as_os_str()],
                )
                .map_err(BackupError::SnapshotUnavailable)
            },
        ))
    }
}

/// Find the mount root of the volume holding `path`
///
/// On unix, walks up the ancestors while the device id stays the same.
/// Elsewhere, returns the path's root component.
pub fn volume_root(path: &Path) -> Result<PathBuf> {
    let path = path.canonicalize()?;
    volume_root_of(&path)
}

#[cfg(unix)]
fn volume_root_of(path: &Path) -> Result<PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let device = std::fs::metadata(path)?.dev();
    let mut root = path.to_path_buf();
    for ancestor in path.ancestors().skip(1) {
        match std::fs::metadata(ancestor) {
            Ok(meta) if meta.dev() == device => root = ancestor.to_path_buf(),
            _ => break,
        }
    }
    Ok(root)
}

#[cfg(not(unix))]
fn volume_root_of(path: &Path) -> Result<PathBuf> {
    Ok(path
        .ancestors()
        .last()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf()))
}
