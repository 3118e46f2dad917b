//! Backup engine
//!
//! [`BackupEngine`] runs one backup session end to end:
//!
//! 1. Check the source, probe the remote host (if any), then probe write
//!    access to the target root. Nothing is written before these pass.
//! 2. Load prior sessions and build the dedup matcher.
//! 3. Try to snapshot the source volume; on failure, warn and read live.
//! 4. Create the session directory and, for archive output, a lazy archive.
//! 5. Stream the source through the pipeline:
//!
//! ```text
//! scanner ──scan queue──> N hashing workers ──commit queue──> N commit workers
//!                                                               │
//!                          resolve (prior / current / claim) <──┤
//!                          link or copy into files/         <──┤
//!                          append manifest line, publish    <──┘
//! ```
//!
//! 6. Close the archive, release the snapshot and finalize `session.json`.
//!
//! Per-file failures are counted and logged; the run carries on. Fatal
//! failures (lost remote connectivity, manifest write errors, cancellation)
//! cancel the run token. Workers stop at their next dequeue or claim wait,
//! and the session is finalized as `Aborted`. Everything already in the
//! manifest stays valid.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hlbackup::{BackupBuilder, OutputMode};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BackupBuilder::new()
//!     .parallel_workers(4)
//!     .output(OutputMode::Tree)
//!     .exclude_patterns(vec!["**/*.tmp".to_string()])
//!     .build(PathBuf::from("/data"), PathBuf::from("/mnt/backups"))?;
//!
//! let report = engine.run()?;
//! println!("{} linked, {} copied", report.stats.files_linked, report.stats.files_copied);
//! # Ok(())
//! # }
//! ```

use crate::archive::ArchiveWriter;
use crate::error::{BackupError, CommitError, Result};
use crate::file_tracking::{ScanEntry, SourceScanner};
use crate::fingerprint::{ContentFingerprint, FingerprintPolicy, SourceFileHandle};
use crate::log_sink::{LogCategory, LogSink, LogSinkExt, TracingSink};
use crate::matcher::{DedupMatcher, Resolution};
use crate::queue::{CancellationToken, WorkQueue};
use crate::remote::{RemoteChannel, RemoteConfig, SshChannel};
use crate::session::{SessionStatus, SessionStore, SessionWriter};
use crate::snapshot::{self, SnapshotHandle, SnapshotProvider};
use crate::target::{CommitOutcome, LocalTarget, RemoteShareTarget, TargetAdapter};
use crate::types::{
    join_relative, BackupConfig, BackupReport, BackupStats, CommittedFile, EngineState,
    OutputMode, ARCHIVE_FILE, SESSION_FILES_DIR,
};
use crate::utils;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

const STATUS_INTERVAL: Duration = Duration::from_millis(100);

/// Builder for configuring a [`BackupEngine`]
pub struct BackupBuilder {
    parallel_workers: usize,
    output: OutputMode,
    archive_path: Option<PathBuf>,
    exclude_patterns: Vec<String>,
    fingerprint_policy: FingerprintPolicy,
    verify_matches: bool,
    follow_symlinks: bool,
    run_timeout: Option<Duration>,
    remote: Option<RemoteConfig>,
    remote_channel: Option<Arc<dyn RemoteChannel>>,
    snapshot_provider: Option<Arc<dyn SnapshotProvider>>,
    log_sink: Arc<dyn LogSink>,
    cancellation: CancellationToken,
}

impl Default for BackupBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackupBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupBuilder")
            .field("parallel_workers", &self.parallel_workers)
            .field("output", &self.output)
            .field("remote", &self.remote)
            .field(
                "snapshot_provider",
                &self.snapshot_provider.as_ref().map(|p| p.name().to_string()),
            )
            .finish_non_exhaustive()
    }
}

impl BackupBuilder {
    /// Create a new builder with default settings
    ///
    /// Defaults: one worker per CPU in each stage, tree output, full-content
    /// fingerprints, no snapshot, events forwarded to `tracing`.
    pub fn new() -> Self {
        Self {
            parallel_workers: num_cpus::get(),
            output: OutputMode::default(),
            archive_path: None,
            exclude_patterns: Vec::new(),
            fingerprint_policy: FingerprintPolicy::default(),
            verify_matches: false,
            follow_symlinks: false,
            run_timeout: None,
            remote: None,
            remote_channel: None,
            snapshot_provider: None,
            log_sink: Arc::new(TracingSink),
            cancellation: CancellationToken::new(),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: &BackupConfig) -> Self {
        let mut builder = Self::new()
            .parallel_workers(config.parallel_workers)
            .output(config.output)
            .exclude_patterns(config.exclude_patterns.clone())
            .fingerprint_policy(config.fingerprint_policy)
            .verify_matches(config.verify_matches)
            .follow_symlinks(config.follow_symlinks);
        builder.archive_path = config.archive_path.clone();
        builder.run_timeout = config.run_timeout;
        builder.remote = config.remote.clone();
        builder
    }

    /// Set number of parallel workers per stage (minimum 1)
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.parallel_workers = count.max(1);
        self
    }

    /// Set what the session contains
    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    /// Write the archive somewhere other than the session directory
    pub fn archive_path(mut self, path: PathBuf) -> Self {
        self.archive_path = Some(path);
        self
    }

    /// Set exclude glob patterns, relative to the source root
    pub fn exclude_patterns(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    /// Set the fingerprint policy
    pub fn fingerprint_policy(mut self, policy: FingerprintPolicy) -> Self {
        self.fingerprint_policy = policy;
        self
    }

    /// Byte-compare each link candidate before linking
    pub fn verify_matches(mut self, verify: bool) -> Self {
        self.verify_matches = verify;
        self
    }

    /// Set whether to follow symbolic links in the source
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Cancel the run if it takes longer than `timeout`
    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Treat the target as a share mounted from `remote`
    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Use a custom command channel instead of `ssh` for the remote host
    pub fn remote_channel(mut self, channel: Arc<dyn RemoteChannel>) -> Self {
        self.remote_channel = Some(channel);
        self
    }

    /// Read the source through snapshots from `provider`
    pub fn snapshot_provider(mut self, provider: Arc<dyn SnapshotProvider>) -> Self {
        self.snapshot_provider = Some(provider);
        self
    }

    /// Send user-facing events to `sink`
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    /// Abort runs when `token` is cancelled
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Validate the settings and build the engine
    ///
    /// Fails with `Configuration` for inconsistent settings. The filesystem is
    /// not touched; availability checks happen when the engine runs.
    pub fn build(self, source: PathBuf, target: PathBuf) -> Result<BackupEngine> {
        if source.as_os_str().is_empty() || target.as_os_str().is_empty() {
            return Err(BackupError::configuration("Source and target are required"));
        }
        if self.archive_path.is_some() && !self.output.writes_archive() {
            return Err(BackupError::configuration(
                "An archive path was given but the output mode writes no archive",
            ));
        }
        if let FingerprintPolicy::Sampled { window: 0, .. } = self.fingerprint_policy {
            return Err(BackupError::configuration("Sample window must be positive"));
        }
        if self.remote_channel.is_some() && self.remote.is_none() {
            return Err(BackupError::configuration(
                "A remote channel needs the remote settings it connects to",
            ));
        }
        if lies_within(&target, &source) {
            return Err(BackupError::configuration(format!(
                "Target {:?} lies inside source {:?}",
                target, source
            )));
        }

        let adapter = match &self.remote {
            None => TargetAdapter::Local(LocalTarget::new(target.clone())),
            Some(remote) => {
                let channel = self
                    .remote_channel
                    .unwrap_or_else(|| Arc::new(SshChannel::new(remote.clone())));
                TargetAdapter::Remote(RemoteShareTarget::new(
                    target.clone(),
                    &remote.remote_root,
                    channel,
                ))
            }
        };

        let config = BackupConfig {
            source,
            target,
            remote: self.remote,
            parallel_workers: self.parallel_workers.max(1),
            output: self.output,
            archive_path: self.archive_path,
            exclude_patterns: self.exclude_patterns,
            fingerprint_policy: self.fingerprint_policy,
            verify_matches: self.verify_matches,
            follow_symlinks: self.follow_symlinks,
            run_timeout: self.run_timeout,
        };

        Ok(BackupEngine {
            config,
            target: adapter,
            snapshots: self.snapshot_provider,
            sink: self.log_sink,
            token: self.cancellation,
            state: Mutex::new(EngineState::Idle),
        })
    }
}

fn normalized(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn lies_within(inner: &Path, outer: &Path) -> bool {
    normalized(inner).starts_with(normalized(outer))
}

/// Runs backup sessions for one source/target pair
pub struct BackupEngine {
    config: BackupConfig,
    target: TargetAdapter,
    snapshots: Option<Arc<dyn SnapshotProvider>>,
    sink: Arc<dyn LogSink>,
    token: CancellationToken,
    state: Mutex<EngineState>,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("config", &self.config)
            .field("target", &self.target)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl BackupEngine {
    /// Build an engine from a complete configuration with default sinks
    pub fn new(config: BackupConfig) -> Result<Self> {
        BackupBuilder::from_config(&config).build(config.source, config.target)
    }

    /// Effective configuration
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Token that aborts the run when cancelled
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.lock();
        if *state != next {
            info!("Engine state {} -> {}", *state, next);
            *state = next;
        }
    }

    /// Run one backup session
    ///
    /// Returns the report of a finalized session, or the error that aborted
    /// the run. An aborted run that got as far as creating its session still
    /// leaves a valid, `Aborted` session behind.
    #[instrument(skip(self), fields(source = ?self.config.source, target = ?self.config.target))]
    pub fn run(&self) -> Result<BackupReport> {
        let start = Instant::now();
        self.set_state(EngineState::Idle);
        let token = self.token.child_token();

        let result = self.execute(&token, start);
        if let Err(e) = &result {
            self.set_state(EngineState::Aborted);
            self.sink.emit(LogCategory::Error, e.user_message());
        }
        result
    }

    fn execute(&self, token: &CancellationToken, start: Instant) -> Result<BackupReport> {
        let config = &self.config;
        if !config.source.is_dir() {
            return Err(BackupError::SourceUnavailable(config.source.clone()));
        }
        // Remote first: an unreachable host must not leave anything on the share
        self.target.probe_remote(token)?;
        self.target.probe_write_access()?;

        let store = SessionStore::new(config.target.clone());
        let matcher = if config.output.writes_tree() {
            let prior = store.load_sessions()?;
            let matcher = DedupMatcher::new(&prior, config.fingerprint_policy);
            self.sink.emit(
                LogCategory::Info,
                format!(
                    "Loaded {} prior sessions ({} distinct contents)",
                    prior.len(),
                    matcher.prior().len()
                ),
            );
            matcher
        } else {
            DedupMatcher::new(&[], config.fingerprint_policy)
        };

        let mut warnings = Vec::new();
        let snapshot = self.acquire_snapshot(&mut warnings);
        let read_root = snapshot
            .as_ref()
            .map(|(_, root)| root.clone())
            .unwrap_or_else(|| config.source.clone());
        self.set_state(EngineState::SnapshotAcquired);

        let mut writer = store.create_session(
            &config.source,
            config.output,
            config.fingerprint_policy,
            Local::now(),
        )?;
        let snapshot_used = snapshot.is_some();
        writer.set_snapshot_used(snapshot_used);
        let session_id = writer.id().to_string();
        let session_name = writer.name().to_string();
        let session_dir = writer.dir().to_path_buf();
        self.sink
            .emit(LogCategory::Info, format!("Started session {}", session_name));

        let archive_path = config.output.writes_archive().then(|| {
            config
                .archive_path
                .clone()
                .unwrap_or_else(|| session_dir.join(ARCHIVE_FILE))
        });
        let archive = archive_path
            .as_ref()
            .map(|path| Mutex::new(ArchiveSink::new(path.clone())));

        let (pipeline, counters, failure, timed_out) = {
            let ctx = RunContext {
                config,
                target: &self.target,
                matcher: &matcher,
                writer: &writer,
                archive: archive.as_ref(),
                sink: self.sink.as_ref(),
                token,
                session_name: session_name.clone(),
                files_root: writer.files_root(),
                counters: Counters::default(),
                failure: Mutex::new(None),
                warnings: Mutex::new(Vec::new()),
                last_status: Mutex::new(Instant::now()),
            };

            let watchdog = config
                .run_timeout
                .map(|timeout| Watchdog::start(timeout, token.clone()));
            let pipeline = self.run_pipeline(&ctx, &read_root);
            let timed_out = watchdog.map(Watchdog::finish).unwrap_or(false);

            warnings.extend(ctx.warnings.into_inner());
            (pipeline, ctx.counters, ctx.failure.into_inner(), timed_out)
        };

        if let Some(archive) = &archive {
            archive.lock().writer.close();
        }
        if let Some((handle, _)) = snapshot {
            if let Err(e) = handle.release() {
                let message = format!("Failed to release snapshot: {}", e);
                warn!("{}", message);
                warnings.push(message);
            }
        }

        let mut stats = counters.snapshot();
        if let Some(archive) = &archive {
            stats.files_archived = archive.lock().writer.entries();
        }

        let outcome = match (failure, pipeline) {
            (Some(e), _) | (None, Err(e)) => Err(e),
            (None, Ok(())) if token.is_cancelled() => Err(BackupError::Cancelled),
            (None, Ok(())) => Ok(()),
        };

        if let Err(e) = outcome {
            if timed_out {
                warn!("Run exceeded its timeout of {:?}", config.run_timeout);
            }
            if let Err(finalize_error) = writer.finalize(SessionStatus::Aborted, stats) {
                warn!("Failed to finalize aborted session: {}", finalize_error);
            }
            return Err(e);
        }

        let session = writer.finalize(SessionStatus::Completed, stats.clone())?;
        self.set_state(EngineState::Finalized);

        let duration_ms = start.elapsed().as_millis() as u64;
        self.sink.emit(
            LogCategory::Summary,
            format!(
                "Session {}: {} files, {} linked ({}), {} copied ({}), {} failed in {:.1}s",
                session.name,
                session.files.len(),
                stats.files_linked,
                utils::format_bytes(stats.bytes_linked),
                stats.files_copied,
                utils::format_bytes(stats.bytes_copied),
                stats.files_failed,
                duration_ms as f64 / 1000.0
            ),
        );

        Ok(BackupReport {
            session_id,
            session_name,
            session_dir,
            state: EngineState::Finalized,
            stats,
            snapshot_used,
            archive_path: archive_path.filter(|p| p.exists()),
            duration_ms,
            warnings,
        })
    }

    /// Try to snapshot the source volume; `None` means read the live tree
    fn acquire_snapshot(&self, warnings: &mut Vec<String>) -> Option<(SnapshotHandle, PathBuf)> {
        let provider = self.snapshots.as_ref()?;
        let attempt = self.config.source.canonicalize().map_err(BackupError::from).and_then(
            |source| {
                let volume = snapshot::volume_root(&source)?;
                let handle = provider.try_create_snapshot(&volume)?;
                let read_root = handle.map_path(&source);
                Ok((handle, read_root))
            },
        );

        match attempt {
            Ok((handle, read_root)) => {
                self.sink.emit(
                    LogCategory::Info,
                    format!("Reading source through {} snapshot", provider.name()),
                );
                Some((handle, read_root))
            }
            Err(e) => {
                let message = format!("Snapshot unavailable ({}); reading live source", e);
                warn!("{}", message);
                self.sink.emit(LogCategory::Warning, message.clone());
                warnings.push(message);
                None
            }
        }
    }

    fn run_pipeline(&self, ctx: &RunContext<'_>, read_root: &Path) -> Result<()> {
        let workers = ctx.config.parallel_workers;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers * 2)
            .thread_name(|i| format!("hlbackup-worker-{}", i))
            .build()
            .map_err(|e| BackupError::internal(format!("cannot start worker pool: {}", e)))?;

        let scan_queue: WorkQueue<ScanEntry> = WorkQueue::new();
        let commit_queue: WorkQueue<CommitItem> = WorkQueue::new();
        let hashers_left = AtomicUsize::new(workers);
        let scanner = SourceScanner::new(read_root.to_path_buf())
            .with_exclude_patterns(ctx.config.exclude_patterns.clone())
            .with_follow_symlinks(ctx.config.follow_symlinks);

        self.set_state(EngineState::Enumerating);
        pool.in_place_scope(|s| {
            for _ in 0..workers {
                s.spawn(|_| {
                    ctx.hash_worker(&scan_queue, &commit_queue);
                    if hashers_left.fetch_sub(1, Ordering::SeqCst) == 1 {
                        commit_queue.close();
                    }
                });
            }
            for _ in 0..workers {
                s.spawn(|_| ctx.commit_worker(&commit_queue));
            }

            let scanned = scanner.scan(|entry| {
                if ctx.token.is_cancelled() {
                    return Err(BackupError::Cancelled);
                }
                if let ScanEntry::File(_) = entry {
                    ctx.counters.files_seen.fetch_add(1, Ordering::Relaxed);
                }
                scan_queue.enqueue(entry);
                Ok(())
            });
            scan_queue.close();

            match scanned {
                Ok(summary) => {
                    ctx.sink.emit(
                        LogCategory::Scan,
                        format!(
                            "Enumerated {} files ({})",
                            summary.files,
                            utils::format_bytes(summary.total_bytes)
                        ),
                    );
                    if summary.symlinks_skipped > 0 {
                        ctx.warn(format!("Skipped {} symbolic links", summary.symlinks_skipped));
                    }
                    if summary.unreadable > 0 {
                        ctx.warn(format!("Skipped {} unreadable entries", summary.unreadable));
                    }
                    if !ctx.token.is_cancelled() {
                        self.set_state(EngineState::Committing);
                    }
                }
                Err(BackupError::Cancelled) => {}
                Err(e) => ctx.fail(e),
            }
        });
        Ok(())
    }
}

/// Work handed from hashing to commit workers
enum CommitItem {
    File {
        handle: SourceFileHandle,
        fingerprint: ContentFingerprint,
    },
    EmptyDirectory(String),
}

#[derive(Default)]
struct Counters {
    files_seen: AtomicU64,
    files_linked: AtomicU64,
    files_copied: AtomicU64,
    files_failed: AtomicU64,
    bytes_copied: AtomicU64,
    bytes_linked: AtomicU64,
    directories_created: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BackupStats {
        BackupStats {
            files_seen: self.files_seen.load(Ordering::Relaxed),
            files_linked: self.files_linked.load(Ordering::Relaxed),
            files_copied: self.files_copied.load(Ordering::Relaxed),
            files_archived: 0,
            files_failed: self.files_failed.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            bytes_linked: self.bytes_linked.load(Ordering::Relaxed),
            directories_created: self.directories_created.load(Ordering::Relaxed),
        }
    }
}

/// Archive writer plus the first error that broke it
struct ArchiveSink {
    writer: ArchiveWriter,
    broken: Option<String>,
}

impl ArchiveSink {
    fn new(path: PathBuf) -> Self {
        Self {
            writer: ArchiveWriter::new(path),
            broken: None,
        }
    }

    fn guarded<T>(&mut self, add: impl FnOnce(&mut ArchiveWriter) -> Result<T>) -> Result<T> {
        if let Some(reason) = &self.broken {
            return Err(BackupError::archive(format!("archive unusable: {}", reason)));
        }
        add(&mut self.writer).inspect_err(|e| {
            // A failed tar append may leave a partial entry; nothing after it is trustworthy
            self.broken = Some(e.to_string());
        })
    }
}

/// Everything one run's workers share
struct RunContext<'a> {
    config: &'a BackupConfig,
    target: &'a TargetAdapter,
    matcher: &'a DedupMatcher,
    writer: &'a SessionWriter,
    archive: Option<&'a Mutex<ArchiveSink>>,
    sink: &'a dyn LogSink,
    token: &'a CancellationToken,
    session_name: String,
    files_root: PathBuf,
    counters: Counters,
    failure: Mutex<Option<BackupError>>,
    warnings: Mutex<Vec<String>>,
    last_status: Mutex<Instant>,
}

impl RunContext<'_> {
    /// Record a fatal error (first one wins) and stop the run
    fn fail(&self, error: BackupError) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                warn!("Aborting run: {}", error);
                *failure = Some(error);
            }
        }
        self.token.cancel();
    }

    fn file_failed(&self, error: BackupError) {
        self.counters.files_failed.fetch_add(1, Ordering::Relaxed);
        warn!("{}", error);
        self.sink.emit(LogCategory::Error, error.to_string());
    }

    fn warn(&self, message: String) {
        warn!("{}", message);
        self.sink.emit(LogCategory::Warning, message.clone());
        self.warnings.lock().push(message);
    }

    fn report_progress(&self) {
        let Some(mut last) = self.last_status.try_lock() else {
            return;
        };
        if last.elapsed() < STATUS_INTERVAL {
            return;
        }
        *last = Instant::now();
        drop(last);

        let stats = self.counters.snapshot();
        self.sink.status(&format!(
            "{} / {} files: {} linked, {} copied ({})",
            stats.files_committed() + stats.files_failed,
            stats.files_seen,
            stats.files_linked,
            stats.files_copied,
            utils::format_bytes(stats.bytes_copied)
        ));
    }

    fn hash_worker(&self, input: &WorkQueue<ScanEntry>, output: &WorkQueue<CommitItem>) {
        while let Ok(entry) = input.dequeue(self.token) {
            match entry {
                ScanEntry::EmptyDirectory(relative) => output.enqueue(CommitItem::EmptyDirectory(relative)),
                ScanEntry::File(handle) => match handle.fingerprint(self.config.fingerprint_policy) {
                    Ok(fingerprint) => {
                        trace!("Fingerprinted {} as {}", handle.relative_path, fingerprint.short());
                        output.enqueue(CommitItem::File { handle, fingerprint });
                    }
                    Err(e) => {
                        let path = handle.source_path.clone();
                        self.file_failed(BackupError::commit(
                            handle.relative_path,
                            CommitError::from_io(e, path),
                        ));
                    }
                },
            }
        }
    }

    fn commit_worker(&self, input: &WorkQueue<CommitItem>) {
        while let Ok(item) = input.dequeue(self.token) {
            let result = match item {
                CommitItem::File { handle, fingerprint } => self.commit_file(&handle, fingerprint),
                CommitItem::EmptyDirectory(relative) => self.commit_directory(&relative),
            };
            match result {
                Ok(()) => self.report_progress(),
                Err(e) if e.is_fatal() => self.fail(e),
                Err(e) => self.file_failed(e),
            }
        }
    }

    fn commit_file(&self, handle: &SourceFileHandle, fingerprint: ContentFingerprint) -> Result<()> {
        let relative = handle.relative_path.as_str();
        if self.config.output.writes_tree() {
            let committed = self.commit_to_tree(handle, fingerprint)?;
            if let Some(archive) = self.archive {
                if let Err(e) = self.archive_file(archive, relative, &committed) {
                    self.warn(format!("{} not archived: {}", relative, e));
                }
            }
            return Ok(());
        }

        let archive = self
            .archive
            .ok_or_else(|| BackupError::internal("output mode writes neither tree nor archive"))?;
        let stored = self.archive_file(archive, relative, &handle.source_path)?;
        // Sampled fingerprints cannot be checked against the stream
        let recorded = match self.config.fingerprint_policy.sample_window(stored.length) {
            None => stored,
            Some(_) => fingerprint,
        };
        if recorded != fingerprint {
            self.warn(format!("{} changed while being archived", relative));
        }
        self.writer.append(CommittedFile::new(relative, recorded))?;
        self.sink.emit(LogCategory::Copy, format!("{} (archived)", relative));
        Ok(())
    }

    /// Link or copy one file into the session tree and record it
    ///
    /// Returns the committed path.
    fn commit_to_tree(&self, handle: &SourceFileHandle, fingerprint: ContentFingerprint) -> Result<PathBuf> {
        let relative = handle.relative_path.as_str();
        let destination_relative = format!("{}/{}/{}", self.session_name, SESSION_FILES_DIR, relative);

        let resolution = self
            .matcher
            .resolve(&fingerprint, self.token)
            .map_err(|_| BackupError::Cancelled)?;
        let (candidate, claim) = match resolution {
            Resolution::Prior(path) | Resolution::Current(path) => (Some(path), None),
            Resolution::Novel(claim) => (None, Some(claim)),
        };

        let candidate = match candidate {
            Some(path) if self.config.verify_matches => {
                match utils::files_identical(&path, &handle.source_path) {
                    Ok(true) => Some(path),
                    Ok(false) => {
                        self.warn(format!(
                            "{} shares a fingerprint with {:?} but differs; copying",
                            relative, path
                        ));
                        None
                    }
                    Err(e) => {
                        debug!("Cannot compare {} with {:?}: {}", relative, path, e);
                        None
                    }
                }
            }
            other => other,
        };

        let outcome = self
            .target
            .commit(
                candidate.as_deref(),
                &handle.source_path,
                &destination_relative,
                fingerprint.length,
                self.config.fingerprint_policy,
                self.token,
            )
            .map_err(|e| BackupError::commit(relative, e))?;

        // A live source may change between hashing and copying; the copy is
        // what gets recorded and offered for linking
        let drifted = match &outcome {
            CommitOutcome::Copied { fingerprint: copied, .. } if *copied != fingerprint => Some(*copied),
            _ => None,
        };
        let recorded = drifted.unwrap_or(fingerprint);

        self.writer.append(CommittedFile::new(relative, recorded))?;
        let committed = self.target.resolve(&destination_relative);
        match (claim, drifted) {
            (Some(claim), None) => claim.publish(committed.clone()),
            (claim, Some(copied)) => {
                // Waiters on the stale fingerprint take over its claim
                drop(claim);
                self.warn(format!(
                    "{} changed while being backed up; recorded as {}",
                    relative,
                    copied.short()
                ));
                self.matcher.record_committed(copied, committed.clone());
            }
            (None, None) => {}
        }

        match outcome {
            CommitOutcome::Linked { from } => {
                self.counters.files_linked.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_linked
                    .fetch_add(fingerprint.length, Ordering::Relaxed);
                self.sink
                    .emit(LogCategory::Link, format!("{} -> {}", relative, from.display()));
            }
            CommitOutcome::Copied { fingerprint: copied, fell_back } => {
                self.counters.files_copied.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_copied
                    .fetch_add(copied.length, Ordering::Relaxed);
                if fell_back {
                    debug!("{} copied after link fallback", relative);
                }
                self.sink.emit(LogCategory::Copy, relative.to_string());
            }
        }
        Ok(committed)
    }

    /// Append one file to the archive; returns the fingerprint of the stored bytes
    fn archive_file(
        &self,
        archive: &Mutex<ArchiveSink>,
        relative: &str,
        path: &Path,
    ) -> Result<ContentFingerprint> {
        let file = File::open(path)
            .map_err(|e| BackupError::commit(relative, CommitError::from_io(e, path.to_path_buf())))?;
        let length = file.metadata()?.len();
        archive
            .lock()
            .guarded(|writer| writer.add_file(relative, length, file))
    }

    fn commit_directory(&self, relative: &str) -> Result<()> {
        if self.config.output.writes_tree() {
            let directory = join_relative(&self.files_root, relative);
            fs::create_dir_all(&directory)
                .map_err(|e| BackupError::commit(relative, CommitError::from_io(e, directory)))?;
        }
        if let Some(archive) = self.archive {
            let added = archive
                .lock()
                .guarded(|writer| writer.add_empty_directory(relative));
            match added {
                Err(e) if self.config.output.writes_tree() => {
                    self.warn(format!("{}/ not archived: {}", relative, e))
                }
                other => other?,
            }
        }
        self.counters
            .directories_created
            .fetch_add(1, Ordering::Relaxed);
        trace!("Recreated empty directory {}", relative);
        Ok(())
    }
}

/// Cancels the run token if the run outlives its timeout
struct Watchdog {
    done: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    fn start(timeout: Duration, token: CancellationToken) -> Self {
        let (done, finished) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = thread::Builder::new()
            .name("hlbackup-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = finished.recv_timeout(timeout) {
                    flag.store(true, Ordering::SeqCst);
                    token.cancel();
                }
            })
            .map_err(|e| warn!("Run timeout not enforced: {}", e))
            .ok();
        Self {
            done: Some(done),
            handle,
            fired,
        }
    }

    /// Stop watching; reports whether the timeout fired
    fn finish(mut self) -> bool {
        drop(self.done.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.fired.load(Ordering::SeqCst)
    }
}
