//! Main test module for hlbackup
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end backup scenarios
//! - Property-based tests for invariants
//! - Edge cases around names and tree shapes

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::hlbackup::*;
    use std::fs;
    use tempfile::TempDir;

    fn engine_for(source: &TempDir, target: &TempDir) -> BackupEngine {
        BackupBuilder::new()
            .parallel_workers(2)
            .build(source.path().to_path_buf(), target.path().to_path_buf())
            .unwrap()
    }

    #[test]
    fn test_empty_source() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let report = engine_for(&source, &target).run().unwrap();
        assert_eq!(report.stats.files_seen, 0);
        assert_eq!(report.state, EngineState::Finalized);

        let sessions = SessionStore::new(target.path().to_path_buf())
            .load_sessions()
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].files.is_empty());
    }

    #[test]
    fn test_empty_files_are_deduplicated() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::write(source.path().join("one"), b"").unwrap();
        fs::write(source.path().join("two"), b"").unwrap();

        let report = engine_for(&source, &target).run().unwrap();
        assert_eq!(report.stats.files_copied, 1);
        assert_eq!(report.stats.files_linked, 1);
        assert_eq!(fs::read(report.session_dir.join("files/two")).unwrap(), b"");
    }

    #[test]
    fn test_special_filenames() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.with.dots.txt",
            "file@with#special$chars.txt",
            "file(with)parens.txt",
            "file[with]brackets.txt",
            "it's quoted.txt",
        ];
        let mut created = Vec::new();
        for name in &special_names {
            // Skip names the OS refuses
            if fs::write(source.path().join(name), format!("Content of {}", name)).is_ok() {
                created.push(*name);
            }
        }

        let report = engine_for(&source, &target).run().unwrap();
        assert_eq!(report.stats.files_copied, created.len() as u64);
        for name in &created {
            let content = fs::read_to_string(report.session_dir.join("files").join(name)).unwrap();
            assert_eq!(content, format!("Content of {}", name));
        }
    }

    #[test]
    fn test_unicode_filenames() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let unicode_names = vec!["файл.txt", "文件.txt", "ファイル.txt", "αρχείο.txt", "🚀🌟💾.txt"];
        let mut created = Vec::new();
        for name in &unicode_names {
            if fs::write(source.path().join(name), name.as_bytes()).is_ok() {
                created.push(*name);
            }
        }
        if created.is_empty() {
            // No unicode support on this system
            return;
        }

        let first = engine_for(&source, &target).run().unwrap();
        let second = engine_for(&source, &target).run().unwrap();
        assert_eq!(second.stats.files_linked, created.len() as u64);
        for name in &created {
            let path = second.session_dir.join("files").join(name);
            assert_eq!(fs::read(&path).unwrap(), name.as_bytes());
            assert!(utils::same_file(&path, &first.session_dir.join("files").join(name)).unwrap());
        }
    }

    #[test]
    fn test_percent_in_filenames() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::write(source.path().join("100%.txt"), b"full").unwrap();
        fs::write(source.path().join("a%FF"), b"literal").unwrap();

        let report = engine_for(&source, &target).run().unwrap();
        assert_eq!(report.stats.files_copied, 2);
        assert_eq!(fs::read(report.session_dir.join("files/100%.txt")).unwrap(), b"full");
        assert_eq!(fs::read(report.session_dir.join("files/a%FF")).unwrap(), b"literal");

        let session = SessionStore::new(target.path().to_path_buf())
            .load_sessions()
            .unwrap()
            .remove(0);
        let report = SessionVerifier::new().rehash(true).verify(&session).unwrap();
        assert!(report.is_valid(), "{}", report.summary());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_filenames_are_kept_apart() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let ff = OsStr::from_bytes(b"a\xff");
        let fe = OsStr::from_bytes(b"a\xfe");
        // Some filesystems only accept UTF-8 names
        if fs::write(source.path().join(ff), b"first").is_err() {
            return;
        }
        fs::write(source.path().join(fe), b"second").unwrap();

        let engine = engine_for(&source, &target);
        let first = engine.run().unwrap();
        assert_eq!(first.stats.files_copied, 2);
        assert_eq!(first.stats.files_failed, 0);
        let first_files = first.session_dir.join("files");
        assert_eq!(fs::read(first_files.join(ff)).unwrap(), b"first");
        assert_eq!(fs::read(first_files.join(fe)).unwrap(), b"second");

        let second = engine.run().unwrap();
        assert_eq!(second.stats.files_linked, 2);
        assert!(utils::same_file(&first_files.join(ff), &second.session_dir.join("files").join(ff)).unwrap());

        let sessions = SessionStore::new(target.path().to_path_buf())
            .load_sessions()
            .unwrap();
        let mut paths: Vec<String> = sessions[0]
            .files
            .iter()
            .map(|f| f.relative_path.clone())
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["a%FE", "a%FF"]);
        for session in &sessions {
            let report = SessionVerifier::new().rehash(true).verify(session).unwrap();
            assert!(report.is_valid(), "{}", report.summary());
        }
    }

    #[test]
    fn test_deep_nesting() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();

        let mut dir = source.path().to_path_buf();
        for i in 0..40 {
            dir = dir.join(format!("level{}", i));
        }
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("leaf.txt"), b"deep").unwrap();

        let report = engine_for(&source, &target).run().unwrap();
        assert_eq!(report.stats.files_copied, 1);

        let session = SessionStore::new(target.path().to_path_buf())
            .load_sessions()
            .unwrap()
            .remove(0);
        assert!(session.files[0].relative_path.starts_with("level0/level1/"));
        assert!(session.files[0].relative_path.ends_with("level39/leaf.txt"));
        assert!(session.file_path(&session.files[0].relative_path).is_file());
    }

    #[test]
    fn test_same_second_runs_get_distinct_sessions() {
        let source = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        fs::write(source.path().join("a"), b"a").unwrap();

        let engine = engine_for(&source, &target);
        let names: Vec<String> = (0..3).map(|_| engine.run().unwrap().session_name).collect();
        assert_ne!(names[0], names[1]);
        assert_ne!(names[1], names[2]);
        assert_ne!(names[0], names[2]);
    }
}
