//! Integration tests for dumbcas
//!
//! End-to-end scenarios driving the public API the way the command surface
//! would: archive real trees into a store, then restore, verify and
//! collect them.

#[cfg(test)]
mod integration_tests {
    use crate::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn frozen_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 3, 4, 5, 6, 7).unwrap()
    }

    struct Fixture {
        cas: CasTable,
        nodes: NodesTable,
        cache: Cache,
        _store_dir: TempDir,
        interrupt: Interrupt,
    }

    impl Fixture {
        fn new() -> Fixture {
            let store_dir = TempDir::new().unwrap();
            let cas = CasTable::open_or_create(store_dir.path()).unwrap();
            let mut nodes = NodesTable::load(store_dir.path()).unwrap();
            nodes.set_clock(frozen_clock);
            let (cache, load_error) = Cache::load_from(&store_dir.path().join("cache_home"));
            assert!(load_error.is_none());
            Fixture {
                cas,
                nodes,
                cache,
                _store_dir: store_dir,
                interrupt: Interrupt::new(),
            }
        }

        fn archive(&mut self, inputs: Vec<PathBuf>, label: &str) -> ArchiveOutcome {
            let request = ArchiveRequest {
                inputs,
                label: label.to_string(),
                comment: String::new(),
            };
            run_archive(
                &self.cas,
                &self.nodes,
                &mut self.cache,
                &request,
                None,
                &self.interrupt,
            )
            .unwrap()
        }

        fn cas_objects(&self) -> Vec<String> {
            let mut items: Vec<String> = self
                .cas
                .enumerate(&self.interrupt)
                .collect::<Result<Vec<_>>>()
                .unwrap();
            items.sort();
            items
        }

        fn node_names(&self) -> Vec<String> {
            let mut items: Vec<String> = self
                .nodes
                .enumerate(&self.interrupt)
                .collect::<Result<Vec<_>>>()
                .unwrap();
            items.sort();
            items
        }
    }

    fn create_tree(root: &Path, tree: &[(&str, &str)]) {
        for (rel, content) in tree {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        for entry in walkdir::WalkDir::new(root).min_depth(1) {
            let entry = entry.unwrap();
            if entry.file_type().is_dir() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            out.insert(rel, fs::read(entry.path()).unwrap());
        }
        out
    }

    #[test]
    fn test_archive_and_restore_round_trip() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(
            data_dir.path(),
            &[("file1", "content1"), ("dir1/dir2/file2", "content2")],
        );

        let outcome = f.archive(vec![data_dir.path().to_path_buf()], "backup");

        // Two file objects plus the entry manifest.
        let objects = f.cas_objects();
        assert_eq!(objects.len(), 3);
        assert!(objects.contains(&hashing::hash_bytes(b"content1")));
        assert!(objects.contains(&hashing::hash_bytes(b"content2")));
        assert!(objects.contains(&outcome.entry_hash));

        // The timestamped node plus its tag.
        assert_eq!(f.node_names().len(), 2);

        // Every leaf hash in the manifest resolves in the store.
        let entry = load_entry(&f.cas, &outcome.entry_hash).unwrap();
        let mut missing = 0;
        entry.visit_hashes(&mut |h| {
            if f.cas.open(h).is_err() {
                missing += 1;
            }
        });
        assert_eq!(missing, 0);

        let out_dir = TempDir::new().unwrap();
        let out = out_dir.path().join("restored");
        let count = restore(&f.cas, &f.nodes, &outcome.node, &out, &f.interrupt).unwrap();
        assert_eq!(count, 2);
        let restored = read_tree(&out);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored["file1"], b"content1");
        assert_eq!(restored["dir1/dir2/file2"], b"content2");
    }

    #[test]
    fn test_rearchive_unchanged_skips_hashing() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(
            data_dir.path(),
            &[("file1", "content1"), ("dir1/dir2/file2", "content2")],
        );

        let first = f.archive(vec![data_dir.path().to_path_buf()], "backup");
        assert_eq!(first.stats.hashed, 2);
        assert_eq!(first.stats.not_hashed, 0);

        let second = f.archive(vec![data_dir.path().to_path_buf()], "backup");
        // No new objects, one new node, and the hasher never read a byte.
        assert_eq!(f.cas_objects().len(), 3);
        assert_eq!(f.node_names().len(), 3);
        assert_ne!(second.node, first.node);
        assert_eq!(second.stats.not_hashed, 2);
        assert_eq!(second.stats.hashed, 0);
        assert_eq!(second.stats.bytes_hashed, 0);
        assert_eq!(second.entry_hash, first.entry_hash);
    }

    #[test]
    fn test_changed_file_is_rehashed() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(data_dir.path(), &[("file1", "content1")]);

        f.archive(vec![data_dir.path().to_path_buf()], "backup");
        fs::write(data_dir.path().join("file1"), "different length content").unwrap();

        let outcome = f.archive(vec![data_dir.path().to_path_buf()], "backup");
        assert_eq!(outcome.stats.hashed, 1);
        assert_eq!(outcome.stats.not_hashed, 0);
        assert!(f
            .cas_objects()
            .contains(&hashing::hash_bytes(b"different length content")));
    }

    #[test]
    fn test_fsck_quarantines_corrupted_object() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(
            data_dir.path(),
            &[("file1", "content1"), ("dir1/dir2/file2", "content2")],
        );
        f.archive(vec![data_dir.path().to_path_buf()], "backup");

        // Replace content1's bytes in place, preserving the name.
        let hash = hashing::hash_bytes(b"content1");
        let object = f
            .cas
            .root()
            .join("cas")
            .join(&hash[..cas::PREFIX_LENGTH])
            .join(&hash[cas::PREFIX_LENGTH..]);
        fs::write(&object, "content5").unwrap();

        let report = fsck(&f.cas, &f.nodes, &f.interrupt).unwrap();
        assert_eq!(report.corrupted_objects, 1);
        assert_eq!(f.cas_objects().len(), 2);
        assert_eq!(f.node_names().len(), 2);
        assert!(!f.cas.fsck_bit());
    }

    #[test]
    fn test_identical_content_dedupes_across_backups() {
        let mut f = Fixture::new();
        let first_dir = TempDir::new().unwrap();
        create_tree(
            first_dir.path(),
            &[("file1", "content1"), ("dir1/dir2/file2", "content2")],
        );
        f.archive(vec![first_dir.path().to_path_buf()], "first");
        assert_eq!(f.cas_objects().len(), 3);

        let second_dir = TempDir::new().unwrap();
        create_tree(second_dir.path(), &[("copy", "content1")]);
        let outcome = f.archive(vec![second_dir.path().to_path_buf()], "second");

        // Only the new entry manifest is new; the byte-identical file
        // deduplicated.
        assert_eq!(f.cas_objects().len(), 4);
        assert_eq!(outcome.stats.not_archived, 1);
    }

    #[test]
    fn test_gc_after_node_deletion() {
        let mut f = Fixture::new();
        let doomed_dir = TempDir::new().unwrap();
        create_tree(
            doomed_dir.path(),
            &[("only-here", "exclusive bytes"), ("common", "shared bytes")],
        );
        let kept_dir = TempDir::new().unwrap();
        create_tree(
            kept_dir.path(),
            &[("kept", "kept bytes"), ("common", "shared bytes")],
        );

        let doomed = f.archive(vec![doomed_dir.path().to_path_buf()], "doomed");
        let kept = f.archive(vec![kept_dir.path().to_path_buf()], "kept");

        f.nodes.remove(&doomed.node).unwrap();
        f.nodes.remove("tags/doomed").unwrap();

        let report = gc(&f.cas, &f.nodes, &f.interrupt).unwrap();
        // The doomed tree's exclusive file and its manifest disappear.
        assert_eq!(report.swept, 2);
        let objects = f.cas_objects();
        assert!(!objects.contains(&hashing::hash_bytes(b"exclusive bytes")));
        assert!(!objects.contains(&doomed.entry_hash));
        assert!(objects.contains(&hashing::hash_bytes(b"shared bytes")));
        assert!(objects.contains(&hashing::hash_bytes(b"kept bytes")));
        assert!(objects.contains(&kept.entry_hash));

        // The surviving backup still restores.
        let out_dir = TempDir::new().unwrap();
        let count = restore(
            &f.cas,
            &f.nodes,
            &kept.node,
            &out_dir.path().join("out"),
            &f.interrupt,
        )
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_info_lists_files_in_path_order() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(
            data_dir.path(),
            &[("file1", "content1"), ("dir1/dir2/file2", "content2")],
        );
        let outcome = f.archive(vec![data_dir.path().to_path_buf()], "backup");

        let mut out = Vec::new();
        let count = info(&f.cas, &f.nodes, &outcome.node, &mut out).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "dir1/dir2/file2(8)\nfile1(8)\nTotal 2\n"
        );
    }

    #[test]
    fn test_empty_input_list_archives_itself() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        let list = data_dir.path().join("toArchive");
        fs::write(&list, "").unwrap();

        let mut request = read_input_list(&list).unwrap();
        request.comment = "empty run".to_string();
        let outcome = run_archive(
            &f.cas,
            &f.nodes,
            &mut f.cache,
            &request,
            None,
            &f.interrupt,
        )
        .unwrap();

        // The list file itself plus the entry manifest.
        assert_eq!(f.cas_objects().len(), 2);
        let node = f.nodes.read_node(&outcome.node).unwrap();
        assert_eq!(node.entry, outcome.entry_hash);
        assert_eq!(node.comment, "empty run");

        let out_dir = TempDir::new().unwrap();
        let out = out_dir.path().join("out");
        let count = restore(&f.cas, &f.nodes, &outcome.node, &out, &f.interrupt).unwrap();
        assert_eq!(count, 1);
        assert!(out.join("toArchive").exists());
    }

    #[test]
    fn test_same_second_archives_get_distinct_names() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(data_dir.path(), &[("x", "x")]);

        // The clock is frozen, so both runs collide on the base name.
        let first = f.archive(vec![data_dir.path().to_path_buf()], "label");
        let second = f.archive(vec![data_dir.path().to_path_buf()], "label");
        assert_ne!(first.node, second.node);
        assert!(second.node.ends_with("(1)"));
    }

    #[test]
    fn test_store_contents_verify_by_name() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(data_dir.path(), &[("a", "alpha"), ("b", "beta")]);
        f.archive(vec![data_dir.path().to_path_buf()], "backup");

        for hash in f.cas_objects() {
            let mut file = f.cas.open(&hash).unwrap();
            let actual =
                hashing::hash_reader(&mut file, Path::new(&hash), &f.interrupt).unwrap();
            assert_eq!(actual, hash);
        }
    }

    #[test]
    fn test_mixed_file_and_directory_inputs() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(
            data_dir.path(),
            &[("lone", "by itself"), ("tree/inner/leaf", "deep")],
        );

        let outcome = f.archive(
            vec![
                data_dir.path().join("lone"),
                data_dir.path().join("tree"),
            ],
            "mixed",
        );
        assert_eq!(outcome.stats.found, 2);

        let out_dir = TempDir::new().unwrap();
        let out = out_dir.path().join("out");
        restore(&f.cas, &f.nodes, &outcome.node, &out, &f.interrupt).unwrap();
        let restored = read_tree(&out);
        assert_eq!(restored["lone"], b"by itself");
        assert_eq!(restored["inner/leaf"], b"deep");
    }

    #[test]
    fn test_open_store_refuses_when_fsck_needed() {
        let store_dir = TempDir::new().unwrap();
        let (cas, _nodes) = open_store(store_dir.path(), false).unwrap();
        cas.set_fsck_bit();

        assert!(matches!(
            open_store(store_dir.path(), false),
            Err(DumbcasError::Corrupted(_))
        ));
        // Repair and read-only commands may still come through.
        let (cas, nodes) = open_store(store_dir.path(), true).unwrap();
        let interrupt = Interrupt::new();
        fsck(&cas, &nodes, &interrupt).unwrap();
        assert!(open_store(store_dir.path(), false).is_ok());
    }

    #[test]
    fn test_progress_callback_sees_final_counters() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(data_dir.path(), &[("a", "one"), ("b", "two")]);

        let seen_found = Arc::new(AtomicU64::new(0));
        let seen = seen_found.clone();
        let progress: ProgressFn = Arc::new(move |snapshot: &StatsSnapshot| {
            seen.store(snapshot.found, Ordering::SeqCst);
        });
        let request = ArchiveRequest {
            inputs: vec![data_dir.path().to_path_buf()],
            label: "progress".to_string(),
            comment: String::new(),
        };
        run_archive(
            &f.cas,
            &f.nodes,
            &mut f.cache,
            &request,
            Some(progress),
            &f.interrupt,
        )
        .unwrap();
        assert_eq!(seen_found.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unreadable_input_counts_error_but_archives_rest() {
        let mut f = Fixture::new();
        let data_dir = TempDir::new().unwrap();
        create_tree(data_dir.path(), &[("good", "fine")]);

        let outcome = f.archive(
            vec![
                data_dir.path().join("missing"),
                data_dir.path().join("good"),
            ],
            "partial",
        );
        assert_eq!(outcome.stats.errors, 1);
        assert_eq!(outcome.stats.found, 1);
        assert!(f.cas_objects().contains(&hashing::hash_bytes(b"fine")));
    }
}
