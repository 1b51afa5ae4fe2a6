//! Reconstruct a directory tree from a backup node
//!
//! Restore walks the node's entry manifest depth-first and streams each
//! object out of the CAS into a freshly created file. Existing files are
//! never overwritten: a conflict is an error, but the traversal keeps
//! going so one collision does not abandon the rest of the tree. The first
//! error seen is the one returned.

use crate::cas::CasTable;
use crate::entry::{load_entry, Entry};
use crate::error::{DumbcasError, Result};
use crate::interrupt::Interrupt;
use crate::nodes::NodesTable;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use tracing::{debug, info};

/// Restore the backup at `node_name` under `out_dir`. Returns the number
/// of files written.
pub fn restore(
    cas: &CasTable,
    nodes: &NodesTable,
    node_name: &str,
    out_dir: &Path,
    interrupt: &Interrupt,
) -> Result<usize> {
    let node = nodes.read_node(node_name)?;
    let entry = load_entry(cas, &node.entry)?;
    let mut count = 0;
    let mut first_error = None;
    restore_entry(cas, &entry, out_dir, &mut count, &mut first_error, interrupt);
    info!("restored {count} files in {}", out_dir.display());
    match first_error {
        None => Ok(count),
        Some(err) => Err(err),
    }
}

fn restore_entry(
    cas: &CasTable,
    entry: &Entry,
    target: &Path,
    count: &mut usize,
    first_error: &mut Option<DumbcasError>,
    interrupt: &Interrupt,
) {
    if interrupt.is_set() {
        first_error.get_or_insert(DumbcasError::Interrupted);
        return;
    }
    if !entry.sha1.is_empty() {
        match restore_file(cas, entry, target) {
            Ok(()) => {
                debug!("{}({})", target.display(), entry.size);
                *count += 1;
            }
            Err(err) => {
                // Keep going; siblings may still restore fine.
                first_error.get_or_insert(err);
            }
        }
    }
    for (name, child) in &entry.files {
        restore_entry(cas, child, &target.join(name), count, first_error, interrupt);
    }
}

fn restore_file(cas: &CasTable, entry: &Entry, target: &Path) -> Result<()> {
    let mut source = cas.open(&entry.sha1)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| DumbcasError::io(parent, e))?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    let mut dst = options
        .open(target)
        .map_err(|e| DumbcasError::io(target, e))?;
    let written = io::copy(&mut source, &mut dst).map_err(|e| DumbcasError::io(target, e))?;
    if written != entry.size {
        return Err(DumbcasError::corrupted(format!(
            "{}: expected {} bytes, wrote {written}",
            target.display(),
            entry.size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Node;
    use tempfile::TempDir;

    fn setup_backup() -> (CasTable, NodesTable, String, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cas = CasTable::open_or_create(temp_dir.path()).unwrap();
        let nodes = NodesTable::load(temp_dir.path()).unwrap();

        let (h1, _) = cas.add_bytes(b"content1").unwrap();
        let (h2, _) = cas.add_bytes(b"content2").unwrap();
        let entry_json = format!(
            r#"{{"f":{{"dir1":{{"f":{{"file2":{{"h":"{h2}","s":8}}}}}},"file1":{{"h":"{h1}","s":8}}}}}}"#
        );
        let (entry_hash, _) = cas.add_bytes(entry_json.as_bytes()).unwrap();
        let rel = nodes
            .add_entry(
                &Node {
                    entry: entry_hash,
                    comment: String::new(),
                },
                "backup",
            )
            .unwrap();
        (cas, nodes, rel, temp_dir)
    }

    #[test]
    fn test_restore_round_trip() {
        let (cas, nodes, rel, _temp_dir) = setup_backup();
        let out_dir = TempDir::new().unwrap();
        let out = out_dir.path().join("restored");

        let interrupt = Interrupt::new();
        let count = restore(&cas, &nodes, &rel, &out, &interrupt).unwrap();
        assert_eq!(count, 2);
        assert_eq!(fs::read(out.join("file1")).unwrap(), b"content1");
        assert_eq!(fs::read(out.join("dir1/file2")).unwrap(), b"content2");
    }

    #[test]
    fn test_existing_file_is_error_but_siblings_restore() {
        let (cas, nodes, rel, _temp_dir) = setup_backup();
        let out_dir = TempDir::new().unwrap();
        let out = out_dir.path().join("restored");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("file1"), b"already here").unwrap();

        let interrupt = Interrupt::new();
        let err = restore(&cas, &nodes, &rel, &out, &interrupt).unwrap_err();
        assert!(matches!(err, DumbcasError::Io { .. }));
        // The conflicting file is untouched, the sibling still landed.
        assert_eq!(fs::read(out.join("file1")).unwrap(), b"already here");
        assert_eq!(fs::read(out.join("dir1/file2")).unwrap(), b"content2");
    }

    #[test]
    fn test_missing_object_is_error() {
        let (cas, nodes, rel, _temp_dir) = setup_backup();
        let node = nodes.read_node(&rel).unwrap();
        let entry = load_entry(&cas, &node.entry).unwrap();
        let missing = &entry.files["file1"].sha1;
        cas.remove(missing).unwrap();

        let out_dir = TempDir::new().unwrap();
        let interrupt = Interrupt::new();
        assert!(restore(&cas, &nodes, &rel, out_dir.path(), &interrupt).is_err());
    }

    #[test]
    fn test_unknown_node() {
        let (cas, nodes, _rel, _temp_dir) = setup_backup();
        let out_dir = TempDir::new().unwrap();
        let interrupt = Interrupt::new();
        assert!(matches!(
            restore(&cas, &nodes, "2099-01/ghost", out_dir.path(), &interrupt),
            Err(DumbcasError::NotFound(_))
        ));
    }
}
