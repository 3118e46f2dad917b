//! Property-based testing for hlbackup
//!
//! Uses proptest to check dedup and manifest invariants across randomly
//! generated source trees.

use ::hlbackup::session::{read_manifest, write_manifest};
use ::hlbackup::*;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use tempfile::TempDir;

/// Generate a source tree as relative path -> content
///
/// Contents come from a small pool so duplicates are common.
fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    let path = (
        prop::collection::vec("[a-c]{1,3}", 0..=2),
        "[a-z]{1,6}\\.(txt|bin)",
    )
        .prop_map(|(dirs, name)| {
            let mut parts = dirs;
            parts.push(name);
            parts.join("/")
        });
    let content = prop_oneof![
        Just(b"foo".to_vec()),
        Just(b"bar".to_vec()),
        Just(b"baz".to_vec()),
        Just(Vec::new()),
        prop::collection::vec(any::<u8>(), 0..512),
    ];
    prop::collection::btree_map(path, content, 1..20)
}

/// Drop entries whose path is a prefix directory of another entry
fn without_conflicts(tree: BTreeMap<String, Vec<u8>>) -> BTreeMap<String, Vec<u8>> {
    let paths: Vec<String> = tree.keys().cloned().collect();
    tree.into_iter()
        .filter(|(path, _)| {
            let dir = format!("{}/", path);
            !paths.iter().any(|other| other.starts_with(&dir))
        })
        .collect()
}

fn materialize(tree: &BTreeMap<String, Vec<u8>>) -> TempDir {
    let source = TempDir::new().unwrap();
    for (relative, content) in tree {
        let path = source.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    source
}

fn run(source: &TempDir, target: &TempDir, workers: usize) -> BackupReport {
    BackupBuilder::new()
        .parallel_workers(workers)
        .build(source.path().to_path_buf(), target.path().to_path_buf())
        .unwrap()
        .run()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_each_distinct_content_is_copied_once(
        tree in tree_strategy().prop_map(without_conflicts),
        workers in 1usize..4,
    ) {
        let source = materialize(&tree);
        let target = TempDir::new().unwrap();
        let report = run(&source, &target, workers);

        let distinct: BTreeSet<&Vec<u8>> = tree.values().collect();
        prop_assert_eq!(report.stats.files_seen, tree.len() as u64);
        prop_assert_eq!(report.stats.files_copied, distinct.len() as u64);
        prop_assert_eq!(
            report.stats.files_linked,
            (tree.len() - distinct.len()) as u64
        );
    }

    #[test]
    fn prop_manifest_matches_committed_content(
        tree in tree_strategy().prop_map(without_conflicts),
    ) {
        let source = materialize(&tree);
        let target = TempDir::new().unwrap();
        let report = run(&source, &target, 2);

        let manifest = read_manifest(&report.session_dir.join(MANIFEST_FILE)).unwrap();
        prop_assert_eq!(manifest.len(), tree.len());
        for entry in &manifest {
            let expected = &tree[&entry.relative_path];
            prop_assert_eq!(entry.fingerprint, ContentFingerprint::of_bytes(expected));
            let committed = fs::read(join_relative(
                &report.session_dir.join(SESSION_FILES_DIR),
                &entry.relative_path,
            ))
            .unwrap();
            prop_assert_eq!(&committed, expected);
        }
    }

    #[test]
    fn prop_unchanged_rerun_copies_nothing(
        tree in tree_strategy().prop_map(without_conflicts),
    ) {
        let source = materialize(&tree);
        let target = TempDir::new().unwrap();
        run(&source, &target, 2);
        let second = run(&source, &target, 2);

        prop_assert_eq!(second.stats.files_copied, 0);
        prop_assert_eq!(second.stats.files_linked, tree.len() as u64);
    }

    #[test]
    fn prop_fingerprints_separate_different_content(
        a in prop::collection::vec(any::<u8>(), 0..256),
        b in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let fa = ContentFingerprint::of_bytes(&a);
        let fb = ContentFingerprint::of_bytes(&b);
        prop_assert_eq!(fa == fb, a == b);
    }

    #[test]
    fn prop_torn_manifest_tail_is_ignored(
        names in prop::collection::btree_set("[a-z]{1,8}", 1..10),
        tail in "[a-z{\":,]{1,30}",
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let files: Vec<CommittedFile> = names
            .iter()
            .map(|name| CommittedFile::new(name.clone(), ContentFingerprint::of_bytes(name.as_bytes())))
            .collect();
        write_manifest(&path, &files).unwrap();

        // Simulate a crash in the middle of the next append
        let mut handle = fs::OpenOptions::new().append(true).open(&path).unwrap();
        handle.write_all(tail.as_bytes()).unwrap();
        drop(handle);

        prop_assert_eq!(read_manifest(&path).unwrap(), files);
    }
}
