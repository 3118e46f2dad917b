//! Dedup matcher
//!
//! Decides, per source file, whether existing content can be hard-linked
//! instead of copied. Resolution order:
//!
//! 1. **Prior sessions**: a two-level lookup `length -> digest -> path`, built
//!    once per run. When several prior files share a fingerprint, the first one
//!    in session-then-file order wins. All candidates are content-equivalent,
//!    so the choice only needs to be stable.
//! 2. **Current session**: files already committed by this run, which lets
//!    duplicate content inside the source tree fan out as links.
//! 3. Otherwise the file is novel and gets copied.
//!
//! Both lookups are O(1) per query.
//!
//! ## Concurrent fan-out
//!
//! Commit workers run in parallel, so two workers may see the same novel
//! content at the same time. [`DedupMatcher::resolve`] hands exactly one of them
//! a [`ClaimGuard`] (the copier). The others block, cancellably, until that
//! copier publishes its committed path, and then link to it. If the copier
//! fails, its guard marks the slot failed and a waiting worker takes over.

use crate::collections::HashMap;
use crate::fingerprint::{ContentFingerprint, Digest, FingerprintPolicy, SourceFileHandle};
use crate::queue::{CancellationToken, Wakeable};
use crate::types::{join_relative, BackupSession};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Read-only index over all prior sessions
#[derive(Debug, Default)]
pub struct PriorIndex {
    by_length: HashMap<u64, HashMap<Digest, PathBuf>>,
    entries: usize,
}

impl PriorIndex {
    /// Build the index from sessions given oldest first
    ///
    /// Sessions without a file tree (archive-only) hold nothing linkable and
    /// are skipped. Files are only indexed when their recorded fingerprint is
    /// comparable with one computed under `policy`: the session used the same
    /// policy, or both policies hash a file of that length in full.
    pub fn build(sessions: &[BackupSession], policy: FingerprintPolicy) -> Self {
        let mut by_length: HashMap<u64, HashMap<Digest, PathBuf>> = HashMap::default();
        let mut entries = 0;
        let mut incomparable = 0usize;

        for session in sessions.iter().filter(|s| s.has_tree) {
            let files_root = session.files_root();
            for file in &session.files {
                let length = file.fingerprint.length;
                if !comparable(session.policy, policy, length) {
                    incomparable += 1;
                    continue;
                }
                let bucket = by_length.entry(length).or_default();
                bucket.entry(file.fingerprint.digest).or_insert_with(|| {
                    entries += 1;
                    join_relative(&files_root, &file.relative_path)
                });
            }
        }

        if incomparable > 0 {
            debug!(
                "Prior index: skipped {} files fingerprinted under another policy",
                incomparable
            );
        }
        debug!(
            "Prior index: {} distinct contents across {} length buckets",
            entries,
            by_length.len()
        );
        Self { by_length, entries }
    }

    /// Representative path for `fingerprint`, if any prior session has it
    pub fn lookup(&self, fingerprint: &ContentFingerprint) -> Option<&Path> {
        self.by_length
            .get(&fingerprint.length)?
            .get(&fingerprint.digest)
            .map(PathBuf::as_path)
    }

    /// Number of distinct contents indexed
    pub fn len(&self) -> usize {
        self.entries
    }

    /// Whether nothing is indexed
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

fn comparable(recorded: FingerprintPolicy, current: FingerprintPolicy, length: u64) -> bool {
    recorded == current || (recorded.sample_window(length).is_none() && current.sample_window(length).is_none())
}

#[derive(Debug, Clone)]
enum SlotState {
    Pending,
    Committed(PathBuf),
    Failed,
}

struct Slot {
    state: Mutex<SlotState>,
    changed: Condvar,
}

impl Slot {
    fn pending() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Pending),
            changed: Condvar::new(),
        })
    }

    fn set(&self, state: SlotState) {
        *self.state.lock() = state;
        self.changed.notify_all();
    }
}

impl Wakeable for Slot {
    fn wake_all(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }
}

/// Where a file's content will come from
#[derive(Debug)]
pub enum Resolution {
    /// Link to a file in a prior session
    Prior(PathBuf),
    /// Link to a file already committed by this run
    Current(PathBuf),
    /// Novel content; the holder must copy it and publish the result
    Novel(ClaimGuard),
}

/// Exclusive right to commit one piece of novel content
///
/// Call [`ClaimGuard::publish`] after the copy is durable and recorded.
/// Dropping the guard unpublished marks the content failed so that a waiting
/// worker can retry.
pub struct ClaimGuard {
    slots: Arc<DashMap<ContentFingerprint, Arc<Slot>>>,
    fingerprint: ContentFingerprint,
    slot: Arc<Slot>,
    published: bool,
}

impl std::fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("fingerprint", &self.fingerprint)
            .field("published", &self.published)
            .finish()
    }
}

impl ClaimGuard {
    /// Make `committed_path` the link target for this content
    pub fn publish(mut self, committed_path: PathBuf) {
        self.published = true;
        self.slot.set(SlotState::Committed(committed_path));
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        trace!("Claim on {} released unpublished", self.fingerprint.short());
        self.slot.set(SlotState::Failed);
        self.slots
            .remove_if(&self.fingerprint, |_, slot| Arc::ptr_eq(slot, &self.slot));
    }
}

/// Raised when a claim wait is interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveCancelled;

/// Finds existing content to link against
pub struct DedupMatcher {
    prior: PriorIndex,
    current: Arc<DashMap<ContentFingerprint, Arc<Slot>>>,
}

impl std::fmt::Debug for DedupMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupMatcher")
            .field("prior_entries", &self.prior.len())
            .field("current_entries", &self.current.len())
            .finish()
    }
}

impl DedupMatcher {
    /// Build a matcher over prior sessions (oldest first) for a run using `policy`
    pub fn new(prior_sessions: &[BackupSession], policy: FingerprintPolicy) -> Self {
        Self::from_index(PriorIndex::build(prior_sessions, policy))
    }

    /// Build a matcher from a prepared prior index
    pub fn from_index(prior: PriorIndex) -> Self {
        Self {
            prior,
            current: Arc::new(DashMap::new()),
        }
    }

    /// Prior-session index
    pub fn prior(&self) -> &PriorIndex {
        &self.prior
    }

    /// Pure lookup for a handle whose fingerprint is already computed
    ///
    /// Returns `None` for novel content and for handles not yet fingerprinted.
    pub fn find_match(&self, handle: &SourceFileHandle) -> Option<PathBuf> {
        self.lookup(handle.cached_fingerprint()?)
    }

    /// Pure lookup: prior sessions first, then committed files of this run
    pub fn lookup(&self, fingerprint: &ContentFingerprint) -> Option<PathBuf> {
        if let Some(path) = self.prior.lookup(fingerprint) {
            return Some(path.to_path_buf());
        }
        let slot = self.current.get(fingerprint).map(|s| Arc::clone(s.value()))?;
        let state = slot.state.lock();
        match &*state {
            SlotState::Committed(path) => Some(path.clone()),
            _ => None,
        }
    }

    /// Record a committed file of this run without going through a claim
    ///
    /// Earlier records win, matching the prior-session tie-break.
    pub fn record_committed(&self, fingerprint: ContentFingerprint, path: PathBuf) {
        match self.current.entry(fingerprint) {
            Entry::Occupied(entry) => {
                let slot = Arc::clone(entry.get());
                drop(entry);
                let mut state = slot.state.lock();
                if !matches!(*state, SlotState::Committed(_)) {
                    *state = SlotState::Committed(path);
                    drop(state);
                    slot.changed.notify_all();
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Slot {
                    state: Mutex::new(SlotState::Committed(path)),
                    changed: Condvar::new(),
                }));
            }
        }
    }

    /// Resolve where `fingerprint`'s content comes from, claiming it if novel
    ///
    /// Blocks while another worker is committing the same content.
    pub fn resolve(
        &self,
        fingerprint: &ContentFingerprint,
        token: &CancellationToken,
    ) -> Result<Resolution, ResolveCancelled> {
        if let Some(path) = self.prior.lookup(fingerprint) {
            return Ok(Resolution::Prior(path.to_path_buf()));
        }

        loop {
            if token.is_cancelled() {
                return Err(ResolveCancelled);
            }

            let slot = match self.current.entry(*fingerprint) {
                Entry::Vacant(entry) => {
                    let slot = Slot::pending();
                    entry.insert(Arc::clone(&slot));
                    return Ok(Resolution::Novel(ClaimGuard {
                        slots: Arc::clone(&self.current),
                        fingerprint: *fingerprint,
                        slot,
                        published: false,
                    }));
                }
                Entry::Occupied(entry) => Arc::clone(entry.get()),
            };

            match wait_for_slot(&slot, token)? {
                SlotState::Committed(path) => return Ok(Resolution::Current(path)),
                SlotState::Failed => {
                    // The failed owner removes its slot; clear it here too in
                    // case we raced ahead of that removal
                    self.current
                        .remove_if(fingerprint, |_, s| Arc::ptr_eq(s, &slot));
                }
                SlotState::Pending => {}
            }
        }
    }
}

fn wait_for_slot(slot: &Arc<Slot>, token: &CancellationToken) -> Result<SlotState, ResolveCancelled> {
    let mut registered = false;
    let mut state = slot.state.lock();
    loop {
        if token.is_cancelled() {
            return Err(ResolveCancelled);
        }
        if !matches!(*state, SlotState::Pending) {
            return Ok(state.clone());
        }
        if !registered {
            drop(state);
            let weak: Weak<dyn Wakeable> = Arc::downgrade(slot) as Weak<dyn Wakeable>;
            token.register(weak);
            registered = true;
            state = slot.state.lock();
            continue;
        }
        slot.changed.wait(&mut state);
    }
}
