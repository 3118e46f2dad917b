//! # hlbackup - Versioned backups with hard-link deduplication
//!
//! Every run produces a complete, browsable copy of the source tree in a new
//! timestamped session directory. Content that already exists in an earlier
//! session (or earlier in the same run) is hard-linked instead of copied, so
//! an unchanged file costs a directory entry rather than its size.
//!
//! ## Overview
//!
//! hlbackup provides:
//! - Full-tree sessions that can be browsed and restored with ordinary tools
//! - Deduplication by content fingerprint (length plus XXH3-128 digest)
//! - Targets on the local filesystem or on a share mounted from a remote host,
//!   where links are created over `ssh`
//! - Read-consistent source views through volume snapshots when available
//! - An optional LZ4-compressed tar archive instead of, or next to, the tree
//! - Crash-consistent manifests: an interrupted run leaves a valid session
//!   containing exactly the files it committed
//!
//! ## Architecture
//!
//! - **Source scanning** ([`file_tracking`]): walks the source (or its snapshot)
//!   and streams files into the pipeline
//! - **Fingerprinting** ([`fingerprint`]): hashes file content, fully or by
//!   sampled windows
//! - **Matching** ([`matcher`]): O(1) lookups over prior sessions and the
//!   current run, with a claim protocol so identical novel files are copied
//!   once and linked everywhere else
//! - **Targets** ([`target`], [`remote`]): link-or-copy with atomic copies and
//!   automatic fallback when linking is impossible
//! - **Sessions** ([`session`]): session directories, append-only manifests
//!   and metadata
//! - **Pipeline** ([`engine`], [`queue`]): a scanner, a pool of hashing
//!   workers and a pool of commit workers joined by cancellable queues
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hlbackup::BackupBuilder;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BackupBuilder::new().build(
//!     PathBuf::from("./my_project"), // Directory to back up
//!     PathBuf::from("/mnt/backups"), // Where sessions are kept
//! )?;
//!
//! let report = engine.run()?;
//! println!(
//!     "Session {}: {} copied, {} linked",
//!     report.session_name, report.stats.files_copied, report.stats.files_linked
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Advanced Usage
//!
//! ### Remote targets
//!
//! ```rust,no_run
//! use hlbackup::{BackupBuilder, RemoteConfig};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = RemoteConfig {
//!     login: "backup".to_string(),
//!     password: String::new(), // key-based authentication
//!     host: "nas.local".to_string(),
//!     port: 22,
//!     remote_root: "/volume1/backups".to_string(),
//! };
//! let engine = BackupBuilder::new()
//!     .remote(remote)
//!     .build(PathBuf::from("/data"), PathBuf::from("/mnt/nas/backups"))?;
//! engine.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Observing progress
//!
//! ```rust,no_run
//! use hlbackup::log_sink::{ChannelSink, SinkMessage};
//! use hlbackup::BackupBuilder;
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, events) = ChannelSink::new();
//! let engine = BackupBuilder::new()
//!     .log_sink(Arc::new(sink))
//!     .build(PathBuf::from("/data"), PathBuf::from("/backups"))?;
//!
//! let renderer = std::thread::spawn(move || {
//!     for message in events {
//!         if let SinkMessage::Event(event) = message {
//!             println!("{}", event.to_log_line());
//!         }
//!     }
//! });
//! engine.run()?;
//! drop(engine);
//! renderer.join().ok();
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Sessions
//!
//! A session is one directory under the target root named after its start
//! time (`YYYY-MM-DD_HH-MM-SS`, with `_n` appended on collisions). It holds
//! `session.json`, `manifest.jsonl`, the `files/` tree and, for archive
//! output, `archive.tar.lz4`.
//!
//! ### Fingerprints
//!
//! Two files are considered identical when length and digest match. Files of
//! different lengths are never compared. Hashing is full by default; the
//! sampled policy trades certainty for speed on very large files.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, BackupError>`. Per-file problems are
//! counted and logged without failing the run; only lost remote connectivity,
//! manifest write failures and cancellation abort it.
//!
//! ## Module Organization
//!
//! - [`engine`]: run orchestration and the builder
//! - [`session`]: session store, manifests and metadata
//! - [`matcher`]: dedup lookup and claim protocol
//! - [`target`]: local and remote target adapters
//! - [`remote`]: remote command channel over `ssh`
//! - [`snapshot`]: source snapshot providers
//! - [`archive`]: lazy `.tar.lz4` writer
//! - [`verification`]: session integrity checks
//! - [`log_sink`]: user-facing log events
//! - [`types`]: common types and data structures
//! - [`error`]: error types and handling

// Public API modules
pub mod archive;
pub mod engine;
pub mod error;
pub mod file_tracking;
pub mod fingerprint;
pub mod log_sink;
pub mod matcher;
pub mod queue;
pub mod remote;
pub mod session;
pub mod snapshot;
pub mod target;
pub mod types;
pub mod utils;
pub mod verification;

// Internal modules (not part of public API)
mod collections;

// Re-export main types for convenience
pub use engine::{BackupBuilder, BackupEngine};
pub use error::{BackupError, CommitError, Result};
pub use fingerprint::{ContentFingerprint, Digest, FingerprintPolicy, SourceFileHandle};
pub use log_sink::{LogCategory, LogEvent, LogSink};
pub use matcher::DedupMatcher;
pub use queue::{CancellationToken, WorkQueue};
pub use remote::RemoteConfig;
pub use session::{SessionStatus, SessionStore};
pub use types::*;
pub use verification::{SessionVerifier, VerificationReport};
