//! Session store
//!
//! Every backup run owns one directory under the target root:
//!
//! ```text
//! <target>/
//! └── 2026-10-16_09-30-00/          # `<YYYY-MM-DD_HH-MM-SS>[_<n>]`
//!     ├── session.json              # SessionMetadata
//!     ├── manifest.jsonl            # one CommittedFile per line
//!     ├── files/                    # linked/copied tree (tree output)
//!     └── archive.tar.lz4           # archive output
//! ```
//!
//! The manifest is append-only and flushed after every entry, so a run that is
//! interrupted leaves exactly the entries whose content was already committed.
//! A torn final line (a crash mid-write) is skipped with a warning when the
//! session is loaded again.
//!
//! Prior sessions are loaded oldest first (by creation time, then directory
//! name). That order is what the matcher relies on for its "first
//! representative wins" tie-break.

use crate::error::{BackupError, Result};
use crate::fingerprint::FingerprintPolicy;
use crate::types::{
    BackupSession, BackupStats, CommittedFile, OutputMode, MANIFEST_FILE, SESSION_FILES_DIR,
    SESSION_METADATA_FILE,
};
use crate::collections::HashSet;
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Lifecycle of a session on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Run still going, or the process died mid-run
    InProgress,
    /// Run finished and every committed file is in the manifest
    Completed,
    /// Run failed; manifest entries written so far remain valid
    Aborted,
}

/// Information about the host system
///
/// Captured at session creation for auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    /// Hostname
    pub hostname: String,
    /// Operating system
    pub os: String,
    /// Architecture
    pub arch: String,
    /// Username (if available)
    pub username: Option<String>,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
        }
    }
}

/// Contents of `session.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Unique id (UUID v4)
    pub id: String,
    /// Directory name
    pub name: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Completion time, once finalized
    pub finished_at: Option<DateTime<Utc>>,
    /// Source root of the run
    pub source: PathBuf,
    /// Current status
    pub status: SessionStatus,
    /// What the session contains
    pub output: OutputMode,
    /// Fingerprint policy used for the manifest
    pub policy: FingerprintPolicy,
    /// Whether the source was read through a snapshot
    pub snapshot_used: bool,
    /// Final counters
    pub stats: BackupStats,
    /// Host that produced the session
    pub host: HostInfo,
}

/// Loads prior sessions and creates new ones under a target root
#[derive(Debug, Clone)]
pub struct SessionStore {
    target_root: PathBuf,
}

impl SessionStore {
    /// Create a store rooted at `target_root`
    pub fn new(target_root: PathBuf) -> Self {
        Self { target_root }
    }

    /// Target root
    pub fn root(&self) -> &Path {
        &self.target_root
    }

    /// Load every session under the target root, oldest first
    ///
    /// Directories without a manifest are ignored. A session whose manifest
    /// cannot be parsed is skipped with a warning rather than failing the run;
    /// losing it only costs dedup opportunities.
    pub fn load_sessions(&self) -> Result<Vec<BackupSession>> {
        let mut sessions = Vec::new();
        if !self.target_root.exists() {
            return Ok(sessions);
        }

        for entry in fs::read_dir(&self.target_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            if !dir.join(MANIFEST_FILE).is_file() {
                trace!("Skipping {:?}: no manifest", dir);
                continue;
            }
            match load_session(&dir) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!("Skipping unreadable session {:?}: {}", dir, e),
            }
        }

        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        debug!(
            "Loaded {} prior sessions ({} files)",
            sessions.len(),
            sessions.iter().map(|s| s.files.len()).sum::<usize>()
        );
        Ok(sessions)
    }

    /// Create the directory and files for a new session
    ///
    /// The directory name is derived from `now` in local time; a numeric suffix
    /// is appended if another session already claimed that second.
    pub fn create_session(
        &self,
        source: &Path,
        output: OutputMode,
        policy: FingerprintPolicy,
        now: DateTime<Local>,
    ) -> Result<SessionWriter> {
        fs::create_dir_all(&self.target_root)?;
        let base = now.format("%Y-%m-%d_%H-%M-%S").to_string();

        let mut attempt = 0u32;
        let (name, dir) = loop {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{}_{}", base, attempt)
            };
            let dir = self.target_root.join(&name);
            match fs::create_dir(&dir) {
                Ok(()) => break (name, dir),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        };

        if output.writes_tree() {
            fs::create_dir(dir.join(SESSION_FILES_DIR))?;
        }

        let metadata = SessionMetadata {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            created_at: now.with_timezone(&Utc),
            finished_at: None,
            source: source.to_path_buf(),
            status: SessionStatus::InProgress,
            output,
            policy,
            snapshot_used: false,
            stats: BackupStats::default(),
            host: HostInfo::default(),
        };
        write_metadata(&dir, &metadata)?;

        let manifest = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(dir.join(MANIFEST_FILE))
            .map_err(|e| BackupError::persistence(format!("cannot create manifest: {}", e)))?;

        info!("Created session {} at {:?}", metadata.name, dir);
        Ok(SessionWriter {
            dir,
            metadata,
            inner: Mutex::new(WriterInner {
                manifest: BufWriter::new(manifest),
                paths: HashSet::default(),
                files: Vec::new(),
            }),
            finalized: false,
        })
    }
}

fn load_session(dir: &Path) -> Result<BackupSession> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let metadata = read_metadata(dir).ok();
    let files = read_manifest(&dir.join(MANIFEST_FILE))?;

    let created_at = match &metadata {
        Some(m) => m.created_at,
        None => parse_session_name(&name).unwrap_or_else(|| {
            fs::metadata(dir)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_default()
        }),
    };
    let has_tree = metadata
        .as_ref()
        .map(|m| m.output.writes_tree())
        .unwrap_or(true)
        && dir.join(SESSION_FILES_DIR).is_dir();

    Ok(BackupSession {
        name,
        root_path: dir.to_path_buf(),
        created_at,
        files,
        has_tree,
        policy: metadata.map(|m| m.policy).unwrap_or_default(),
    })
}

fn parse_session_name(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.get(..19)?;
    chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d_%H-%M-%S")
        .ok()
        .and_then(|naive| naive.and_local_timezone(Local).single())
        .map(|local| local.with_timezone(&Utc))
}

/// Read `session.json` from a session directory
pub fn read_metadata(dir: &Path) -> Result<SessionMetadata> {
    let content = fs::read_to_string(dir.join(SESSION_METADATA_FILE))?;
    Ok(serde_json::from_str(&content)?)
}

fn write_metadata(dir: &Path, metadata: &SessionMetadata) -> Result<()> {
    let content = serde_json::to_vec_pretty(metadata)?;
    crate::utils::atomic_write(&dir.join(SESSION_METADATA_FILE), &content)
        .map_err(|e| BackupError::persistence(format!("cannot write session metadata: {}", e)))
}

/// Read a manifest in file order
///
/// A final line without its terminating newline is a torn write and is
/// skipped. Any other malformed line is an error.
pub fn read_manifest(path: &Path) -> Result<Vec<CommittedFile>> {
    let reader = BufReader::new(File::open(path)?);
    let mut files = Vec::new();
    let mut lines = reader.split(b'\n').peekable();
    let mut line_no = 0usize;
    let terminated = manifest_ends_with_newline(path)?;

    while let Some(line) = lines.next() {
        let line = line?;
        line_no += 1;
        let is_last = lines.peek().is_none();
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<CommittedFile>(&line) {
            Ok(file) => files.push(file),
            Err(e) if is_last && !terminated => {
                warn!("Ignoring torn manifest line {} in {:?}: {}", line_no, path, e);
            }
            Err(e) => {
                return Err(BackupError::persistence(format!(
                    "malformed manifest line {} in {:?}: {}",
                    line_no, path, e
                )))
            }
        }
    }
    Ok(files)
}

fn manifest_ends_with_newline(path: &Path) -> Result<bool> {
    use std::io::{Read, Seek, SeekFrom};
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Write a complete manifest; used when exporting or repairing sessions
pub fn write_manifest(path: &Path, files: &[CommittedFile]) -> Result<()> {
    let mut content = Vec::new();
    for file in files {
        serde_json::to_writer(&mut content, file)?;
        content.push(b'\n');
    }
    crate::utils::atomic_write(path, &content)
}

struct WriterInner {
    manifest: BufWriter<File>,
    paths: HashSet<String>,
    files: Vec<CommittedFile>,
}

/// Append-only writer for the session being produced
///
/// `append` is safe to call from many commit workers at once. Dropping a
/// writer that was never finalized marks the session `Aborted`.
pub struct SessionWriter {
    dir: PathBuf,
    metadata: SessionMetadata,
    inner: Mutex<WriterInner>,
    finalized: bool,
}

impl std::fmt::Debug for SessionWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWriter")
            .field("dir", &self.dir)
            .field("name", &self.metadata.name)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl SessionWriter {
    /// Session directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Session directory name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    /// Root of this session's file tree
    pub fn files_root(&self) -> PathBuf {
        self.dir.join(SESSION_FILES_DIR)
    }

    /// Record whether the run reads through a snapshot
    pub fn set_snapshot_used(&mut self, used: bool) {
        self.metadata.snapshot_used = used;
    }

    /// Number of entries appended so far
    pub fn len(&self) -> usize {
        self.inner.lock().files.len()
    }

    /// Whether nothing has been appended yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `relative_path` is already recorded
    pub fn contains(&self, relative_path: &str) -> bool {
        self.inner.lock().paths.contains(relative_path)
    }

    /// Append one committed file and flush it to the manifest
    ///
    /// Fails with `Commit(DestinationExists)` for a duplicate path and with
    /// `Persistence` if the manifest cannot be written.
    pub fn append(&self, file: CommittedFile) -> Result<()> {
        let mut line = serde_json::to_vec(&file)?;
        line.push(b'\n');

        let mut inner = self.inner.lock();
        if inner.paths.contains(&file.relative_path) {
            return Err(BackupError::commit(
                file.relative_path.clone(),
                crate::error::CommitError::DestinationExists(PathBuf::from(&file.relative_path)),
            ));
        }
        inner
            .manifest
            .write_all(&line)
            .and_then(|_| inner.manifest.flush())
            .map_err(|e| BackupError::persistence(format!("manifest append failed: {}", e)))?;
        inner.paths.insert(file.relative_path.clone());
        inner.files.push(file);
        Ok(())
    }

    /// Sync the manifest, write final metadata and return the session record
    pub fn finalize(mut self, status: SessionStatus, stats: BackupStats) -> Result<BackupSession> {
        self.finalized = true;
        self.write_final(status, stats)?;

        let files = std::mem::take(&mut self.inner.lock().files);
        Ok(BackupSession {
            name: self.metadata.name.clone(),
            root_path: self.dir.clone(),
            created_at: self.metadata.created_at,
            files,
            has_tree: self.metadata.output.writes_tree(),
            policy: self.metadata.policy,
        })
    }

    fn write_final(&mut self, status: SessionStatus, stats: BackupStats) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner
                .manifest
                .flush()
                .and_then(|_| inner.manifest.get_ref().sync_all())
                .map_err(|e| BackupError::persistence(format!("manifest sync failed: {}", e)))?;
        }
        self.metadata.status = status;
        self.metadata.stats = stats;
        self.metadata.finished_at = Some(Utc::now());
        write_metadata(&self.dir, &self.metadata)
    }
}

impl Drop for SessionWriter {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        let stats = self.metadata.stats.clone();
        if let Err(e) = self.write_final(SessionStatus::Aborted, stats) {
            warn!("Failed to mark session {} aborted: {}", self.metadata.name, e);
        }
    }
}
