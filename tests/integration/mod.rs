//! End-to-end integration tests for hlbackup
//!
//! Drives complete runs through the public builder: repeated sessions over a
//! changing source, remote and snapshot failure paths, interrupted runs and
//! the archive layouts.

use ::hlbackup::archive::read_archive;
use ::hlbackup::log_sink::MemorySink;
use ::hlbackup::remote::{RemoteChannel, RemoteOutput};
use ::hlbackup::session::{read_manifest, read_metadata};
use ::hlbackup::snapshot::NoSnapshot;
use ::hlbackup::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Source and target directories for one test
pub struct BackupHarness {
    pub source: TempDir,
    pub target: TempDir,
}

impl BackupHarness {
    pub fn new() -> Self {
        Self {
            source: TempDir::new().unwrap(),
            target: TempDir::new().unwrap(),
        }
    }

    pub fn write(&self, relative: &str, content: &[u8]) {
        let path = self.source.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn builder(&self) -> BackupBuilder {
        BackupBuilder::new().parallel_workers(2)
    }

    pub fn build(&self, builder: BackupBuilder) -> BackupEngine {
        builder
            .build(self.source.path().to_path_buf(), self.target.path().to_path_buf())
            .unwrap()
    }

    pub fn run(&self) -> BackupReport {
        self.build(self.builder()).run().unwrap()
    }

    pub fn sessions(&self) -> Vec<BackupSession> {
        SessionStore::new(self.target.path().to_path_buf())
            .load_sessions()
            .unwrap()
    }
}

fn manifest_of(report: &BackupReport) -> Vec<CommittedFile> {
    let mut files = read_manifest(&report.session_dir.join(MANIFEST_FILE)).unwrap();
    files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    files
}

fn tree_file(report: &BackupReport, relative: &str) -> PathBuf {
    join_relative(&report.session_dir.join(SESSION_FILES_DIR), relative)
}

fn linked(a: &Path, b: &Path) -> bool {
    utils::same_file(a, b).unwrap()
}

#[test]
fn test_first_run_copies_every_file() {
    let harness = BackupHarness::new();
    harness.write("A", b"foo");
    harness.write("B", b"bar");

    let report = harness.run();
    assert_eq!(report.stats.files_copied, 2);
    assert_eq!(report.stats.files_linked, 0);
    assert_eq!(report.stats.bytes_copied, 6);

    let manifest = manifest_of(&report);
    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest[0].relative_path, "A");
    assert_eq!(manifest[1].relative_path, "B");
    assert_eq!(manifest[0].fingerprint.length, 3);
    assert_eq!(manifest[1].fingerprint.length, 3);
    assert_ne!(manifest[0].fingerprint.digest, manifest[1].fingerprint.digest);

    assert_eq!(fs::read(tree_file(&report, "A")).unwrap(), b"foo");
    assert_eq!(fs::read(tree_file(&report, "B")).unwrap(), b"bar");
}

#[cfg(unix)]
#[test]
fn test_unchanged_source_links_everything() {
    let harness = BackupHarness::new();
    harness.write("A", b"foo");
    harness.write("B", b"bar");

    let first = harness.run();
    let second = harness.run();

    assert_eq!(second.stats.files_copied, 0);
    assert_eq!(second.stats.files_linked, 2);
    assert_eq!(second.stats.bytes_linked, 6);
    assert!(linked(&tree_file(&first, "A"), &tree_file(&second, "A")));
    assert!(linked(&tree_file(&first, "B"), &tree_file(&second, "B")));
    assert_eq!(utils::link_count(&tree_file(&second, "A")).unwrap(), 2);
}

#[cfg(unix)]
#[test]
fn test_same_length_change_is_copied() {
    let harness = BackupHarness::new();
    harness.write("A", b"foo");
    harness.write("B", b"bar");

    let first = harness.run();
    let second = harness.run();
    harness.write("B", b"baz");
    let third = harness.run();

    assert_eq!(third.stats.files_linked, 1);
    assert_eq!(third.stats.files_copied, 1);
    assert!(linked(&tree_file(&second, "A"), &tree_file(&third, "A")));
    assert!(!linked(&tree_file(&first, "B"), &tree_file(&third, "B")));
    assert_eq!(fs::read(tree_file(&third, "B")).unwrap(), b"baz");
    // Earlier sessions still show the old content
    assert_eq!(fs::read(tree_file(&first, "B")).unwrap(), b"bar");
}

struct UnreachableChannel;

impl RemoteChannel for UnreachableChannel {
    fn probe(&self, _token: &CancellationToken) -> std::result::Result<(), CommitError> {
        Err(CommitError::RemoteUnreachable(
            "ssh: connect to host nas.invalid port 22: No route to host".to_string(),
        ))
    }

    fn execute(
        &self,
        _command: &str,
        _token: &CancellationToken,
    ) -> std::result::Result<RemoteOutput, CommitError> {
        Err(CommitError::RemoteUnreachable("not connected".to_string()))
    }
}

#[test]
fn test_unreachable_remote_aborts_before_touching_target() {
    let harness = BackupHarness::new();
    harness.write("A", b"foo");

    let remote = RemoteConfig::from_parts(
        Some("backup".to_string()),
        Some("secret".to_string()),
        Some("nas.invalid".to_string()),
        Some("/volume1/backups".to_string()),
        Some("22".to_string()),
    )
    .unwrap()
    .unwrap();

    let engine = harness.build(
        harness
            .builder()
            .remote(remote)
            .remote_channel(Arc::new(UnreachableChannel)),
    );
    let err = engine.run().unwrap_err();
    assert!(matches!(err, BackupError::RemoteUnreachable(_)), "{:?}", err);
    assert_eq!(engine.state(), EngineState::Aborted);

    let leftovers: Vec<_> = fs::read_dir(harness.target.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "target was touched: {:?}", leftovers);
}

/// Creates links on the local share, as the remote host would, and drops
/// the connection once `links_before_drop` links have been made
struct LoopbackChannel {
    share_root: PathBuf,
    remote_root: String,
    links_before_drop: Option<usize>,
    links: AtomicUsize,
}

impl LoopbackChannel {
    fn new(share_root: &Path, links_before_drop: Option<usize>) -> Self {
        Self {
            share_root: share_root.to_path_buf(),
            remote_root: "/volume1/backups".to_string(),
            links_before_drop,
            links: AtomicUsize::new(0),
        }
    }

    fn config(&self) -> RemoteConfig {
        RemoteConfig {
            login: "backup".to_string(),
            password: String::new(),
            host: "nas.local".to_string(),
            port: 22,
            remote_root: self.remote_root.clone(),
        }
    }

    fn local(&self, remote: &str) -> PathBuf {
        let rest = remote.strip_prefix(&self.remote_root).unwrap_or(remote);
        self.share_root.join(rest.trim_start_matches('/'))
    }
}

impl RemoteChannel for LoopbackChannel {
    fn probe(&self, _token: &CancellationToken) -> std::result::Result<(), CommitError> {
        Ok(())
    }

    fn execute(
        &self,
        command: &str,
        _token: &CancellationToken,
    ) -> std::result::Result<RemoteOutput, CommitError> {
        Err(CommitError::RemoteCommand {
            command: command.to_string(),
            status: "unsupported".to_string(),
            stderr: String::new(),
        })
    }

    fn link(
        &self,
        existing: &str,
        link: &str,
        _token: &CancellationToken,
    ) -> std::result::Result<(), CommitError> {
        if let Some(limit) = self.links_before_drop {
            if self.links.load(Ordering::SeqCst) >= limit {
                return Err(CommitError::RemoteUnreachable("connection dropped".to_string()));
            }
        }
        fs::hard_link(self.local(existing), self.local(link)).map_err(|e| CommitError::Io {
            path: PathBuf::from(link),
            source: e,
        })?;
        self.links.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(unix)]
#[test]
fn test_remote_target_links_through_the_channel() {
    let harness = BackupHarness::new();
    harness.write("A", b"foo");
    harness.write("dir/B", b"bar");

    let channel = Arc::new(LoopbackChannel::new(harness.target.path(), None));
    let engine = harness.build(
        harness
            .builder()
            .remote(channel.config())
            .remote_channel(channel.clone()),
    );

    let first = engine.run().unwrap();
    assert_eq!(first.stats.files_copied, 2);
    assert_eq!(channel.links.load(Ordering::SeqCst), 0);

    let second = engine.run().unwrap();
    assert_eq!(second.stats.files_linked, 2);
    assert_eq!(second.stats.files_copied, 0);
    assert_eq!(channel.links.load(Ordering::SeqCst), 2);
    assert!(linked(&tree_file(&first, "A"), &tree_file(&second, "A")));
    assert!(linked(&tree_file(&first, "dir/B"), &tree_file(&second, "dir/B")));
}

#[test]
fn test_remote_connection_lost_mid_run_aborts_session() {
    let harness = BackupHarness::new();
    for i in 0..6 {
        harness.write(&format!("f{}.txt", i), format!("content {}", i).as_bytes());
    }
    // First run copies everything, so no link is attempted
    let channel = Arc::new(LoopbackChannel::new(harness.target.path(), Some(0)));
    let builder = || {
        harness
            .builder()
            .remote(channel.config())
            .remote_channel(channel.clone())
    };
    let first = harness.build(builder()).run().unwrap();
    assert_eq!(first.stats.files_copied, 6);

    let engine = harness.build(builder());
    let err = engine.run().unwrap_err();
    assert!(matches!(err, BackupError::RemoteUnreachable(_)), "{:?}", err);
    assert_eq!(engine.state(), EngineState::Aborted);

    let sessions = harness.sessions();
    assert_eq!(sessions.len(), 2);
    let aborted = &sessions[1];
    assert_eq!(read_metadata(&aborted.root_path).unwrap().status, SessionStatus::Aborted);
    assert!(aborted.files.is_empty());
    for session in &sessions {
        let report = SessionVerifier::new().rehash(true).verify(session).unwrap();
        assert!(report.is_valid(), "{}", report.summary());
    }
}

#[test]
fn test_snapshot_failure_falls_back_to_live_read() {
    let harness = BackupHarness::new();
    harness.write("A", b"foo");
    harness.write("dir/B", b"bar");

    let sink = Arc::new(MemorySink::new());
    let engine = harness.build(
        harness
            .builder()
            .snapshot_provider(Arc::new(NoSnapshot))
            .log_sink(sink.clone()),
    );
    let report = engine.run().unwrap();

    assert_eq!(report.state, EngineState::Finalized);
    assert!(!report.snapshot_used);
    assert_eq!(report.stats.files_copied, 2);
    assert!(!report.warnings.is_empty());
    assert!(!sink.messages(LogCategory::Warning).is_empty());

    let metadata = read_metadata(&report.session_dir).unwrap();
    assert!(!metadata.snapshot_used);
}

#[test]
fn test_interrupted_run_leaves_consistent_manifest() {
    let harness = BackupHarness::new();
    for i in 0..400 {
        harness.write(&format!("d{}/f{}.txt", i % 7, i), format!("payload {}", i % 50).as_bytes());
    }

    // Either finishes or is cut short; both must leave a truthful manifest
    let engine = harness.build(
        harness
            .builder()
            .run_timeout(Duration::from_millis(5)),
    );
    let outcome = engine.run();
    if let Err(e) = &outcome {
        assert!(matches!(e, BackupError::Cancelled), "{:?}", e);
    }

    for session in harness.sessions() {
        let report = SessionVerifier::new().rehash(true).verify(&session).unwrap();
        assert!(report.is_valid(), "{}", report.summary());
    }

    // A follow-up run still backs up the complete tree
    let report = harness.run();
    assert_eq!(report.stats.files_seen, 400);
    assert_eq!(report.stats.files_committed(), 400);
    assert_eq!(manifest_of(&report).len(), 400);
}

#[test]
fn test_cancelled_run_marks_session_aborted() {
    let harness = BackupHarness::new();
    harness.write("A", b"foo");

    let token = CancellationToken::new();
    let engine = harness.build(harness.builder().cancellation_token(token.clone()));
    token.cancel();

    assert!(matches!(engine.run(), Err(BackupError::Cancelled)));
    assert_eq!(engine.state(), EngineState::Aborted);
    for session in harness.sessions() {
        let metadata = read_metadata(&session.root_path).unwrap();
        assert_eq!(metadata.status, SessionStatus::Aborted);
    }
}

#[test]
fn test_identical_sources_produce_identical_manifests() {
    let first = BackupHarness::new();
    let second = BackupHarness::new();
    for harness in [&first, &second] {
        harness.write("a.txt", b"one");
        harness.write("b/c.txt", b"two");
        harness.write("b/d.txt", b"one");
        harness.write("e/f/g.bin", &[7u8; 4096]);
    }

    let a = first.build(first.builder().parallel_workers(1)).run().unwrap();
    let b = second.build(second.builder().parallel_workers(4)).run().unwrap();
    assert_eq!(manifest_of(&a), manifest_of(&b));
    assert_eq!(a.stats.files_copied, b.stats.files_copied);
    assert_eq!(a.stats.files_linked, b.stats.files_linked);
}

#[cfg(unix)]
#[test]
fn test_duplicates_within_one_run_are_copied_once() {
    let harness = BackupHarness::new();
    for i in 0..24 {
        harness.write(&format!("copy{}.dat", i), b"same bytes everywhere");
    }

    let report = harness.build(harness.builder().parallel_workers(4)).run().unwrap();
    assert_eq!(report.stats.files_copied, 1);
    assert_eq!(report.stats.files_linked, 23);
    assert_eq!(utils::link_count(&tree_file(&report, "copy0.dat")).unwrap(), 24);
}

#[test]
fn test_archive_only_session() {
    let harness = BackupHarness::new();
    harness.write("A", b"foo");
    harness.write("nested/B", b"bar");
    fs::create_dir_all(harness.source.path().join("empty")).unwrap();

    let report = harness
        .build(harness.builder().output(OutputMode::Archive))
        .run()
        .unwrap();
    let archive = report.archive_path.clone().unwrap();
    assert_eq!(archive, report.session_dir.join(ARCHIVE_FILE));
    assert!(!report.session_dir.join(SESSION_FILES_DIR).exists());
    assert_eq!(report.stats.files_archived, 3);

    let mut entries = read_archive(&archive).unwrap();
    entries.sort();
    assert_eq!(
        entries,
        vec![
            ("A".to_string(), b"foo".to_vec()),
            ("empty/".to_string(), Vec::new()),
            ("nested/B".to_string(), b"bar".to_vec()),
        ]
    );

    // Archive-only sessions are never link sources
    let tree = harness.run();
    assert_eq!(tree.stats.files_copied, 2);
    assert_eq!(tree.stats.files_linked, 0);
}

#[test]
fn test_tree_and_archive_at_custom_path() {
    let harness = BackupHarness::new();
    let archive_dir = TempDir::new().unwrap();
    let archive_path = archive_dir.path().join("backup.tar.lz4");
    harness.write("A", b"foo");
    harness.write("B", b"foo");

    let report = harness
        .build(
            harness
                .builder()
                .output(OutputMode::TreeAndArchive)
                .archive_path(archive_path.clone()),
        )
        .run()
        .unwrap();

    assert_eq!(report.archive_path.as_deref(), Some(archive_path.as_path()));
    assert_eq!(fs::read(tree_file(&report, "B")).unwrap(), b"foo");
    let entries = read_archive(&archive_path).unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|(_, content)| content == b"foo"));
}

#[test]
fn test_excluded_paths_are_not_backed_up() {
    let harness = BackupHarness::new();
    harness.write("keep.txt", b"keep");
    harness.write("target/debug/big.o", b"object");
    harness.write("notes.tmp", b"scratch");

    let report = harness
        .build(
            harness
                .builder()
                .exclude_patterns(vec!["target".to_string(), "*.tmp".to_string()]),
        )
        .run()
        .unwrap();

    let paths: Vec<String> = manifest_of(&report)
        .into_iter()
        .map(|f| f.relative_path)
        .collect();
    assert_eq!(paths, vec!["keep.txt"]);
    assert!(!tree_file(&report, "target").exists());
}

#[cfg(unix)]
#[test]
fn test_verify_matches_still_links_identical_content() {
    let harness = BackupHarness::new();
    harness.write("A", b"foo");

    let first = harness.run();
    let second = harness
        .build(harness.builder().verify_matches(true))
        .run()
        .unwrap();
    assert_eq!(second.stats.files_linked, 1);
    assert!(linked(&tree_file(&first, "A"), &tree_file(&second, "A")));
}

#[test]
fn test_sampled_policy_is_recorded() {
    let harness = BackupHarness::new();
    harness.write("small", b"tiny");

    let policy = FingerprintPolicy::Sampled {
        threshold: 1024,
        window: 64,
    };
    let report = harness
        .build(harness.builder().fingerprint_policy(policy))
        .run()
        .unwrap();
    let metadata = read_metadata(&report.session_dir).unwrap();
    assert_eq!(metadata.policy, policy);
    assert_eq!(harness.sessions()[0].policy, policy);
}
