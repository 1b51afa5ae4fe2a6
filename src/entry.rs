//! Backup manifest tree
//!
//! An [`Entry`] describes either one file (hash and size) or one directory
//! level (a map of child names). The whole manifest of a backup is a single
//! recursive `Entry` whose serialized JSON is itself content-addressed, so
//! the manifest's SHA-1 becomes the stable handle a node points at.
//!
//! The wire format uses compact keys to keep serialized manifests small:
//!
//! ```text
//! {"h": "<sha1>", "s": <size>, "f": {"<name>": Entry, ...}}
//! ```
//!
//! Fields are omitted when empty or zero. Children live in a `BTreeMap` so
//! serialization is deterministic and path-ordered.

use crate::cas::CasTable;
use crate::error::{DumbcasError, Result};
use crate::nodes::NodesTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// One manifest node: a file (`sha1` + `size`) or a directory (`files`).
///
/// Invariant: a node carries either a non-empty `sha1` or a non-empty
/// `files` map, never both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Lowercase hex SHA-1 of the file's bytes; empty for directories.
    #[serde(rename = "h", default, skip_serializing_if = "String::is_empty")]
    pub sha1: String,
    /// File byte length; 0 for directories.
    #[serde(rename = "s", default, skip_serializing_if = "is_zero")]
    pub size: u64,
    /// Child name (single path segment) to child entry.
    #[serde(rename = "f", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, Entry>,
}

impl Entry {
    /// Whether this node describes a directory level.
    pub fn is_dir(&self) -> bool {
        !self.files.is_empty()
    }

    /// Total recursive node count, this node included.
    pub fn count(&self) -> usize {
        1 + self.files.values().map(Entry::count).sum::<usize>()
    }

    /// Descend to the entry at `rel_path`, creating intermediate directory
    /// levels along the way. Each normal path component is one child name.
    pub fn descend(&mut self, rel_path: &Path) -> &mut Entry {
        let mut current = self;
        for component in rel_path.components() {
            if let Component::Normal(name) = component {
                current = current
                    .files
                    .entry(name.to_string_lossy().into_owned())
                    .or_default();
            }
        }
        current
    }

    /// Visit every non-empty file hash in the tree, depth-first.
    pub fn visit_hashes<'a>(&'a self, visit: &mut impl FnMut(&'a str)) {
        if !self.sha1.is_empty() {
            visit(&self.sha1);
        }
        for child in self.files.values() {
            child.visit_hashes(visit);
        }
    }

    /// Dump the tree in a YAML-inspired layout, for debugging and store
    /// inspection.
    pub fn print<W: Write>(&self, out: &mut W, indent: &str) -> std::io::Result<()> {
        if !self.sha1.is_empty() {
            writeln!(out, "{indent}Sha1: {}", self.sha1)?;
            writeln!(out, "{indent}Size: {}", self.size)?;
        }
        for (name, child) in &self.files {
            writeln!(out, "{indent}- '{name}'")?;
            child.print(out, &format!("{indent}  "))?;
        }
        Ok(())
    }

    fn write_listing<W: Write>(&self, out: &mut W, rel_path: &Path) -> Result<usize> {
        let mut count = 0;
        if !self.sha1.is_empty() {
            writeln!(out, "{}({})", rel_path.display(), self.size)
                .map_err(|e| DumbcasError::io(rel_path, e))?;
            count += 1;
        }
        for (name, child) in &self.files {
            count += child.write_listing(out, &rel_path.join(name))?;
        }
        Ok(count)
    }
}

/// Load an entry manifest stored in the CAS.
///
/// A manifest that cannot be opened or decoded marks the store as
/// fsck-needed before the error is surfaced.
pub fn load_entry(cas: &CasTable, hash: &str) -> Result<Entry> {
    let file = match cas.open(hash) {
        Ok(f) => f,
        Err(err) => {
            cas.set_fsck_bit();
            return Err(err);
        }
    };
    serde_json::from_reader(file).map_err(|e| {
        cas.set_fsck_bit();
        DumbcasError::corrupted(format!("entry {hash}: {e}"))
    })
}

/// Print one `<rel_path>(<size>)` line per file of `node_name`'s manifest,
/// in path order, then a `Total <count>` line. Returns the file count.
pub fn info<W: Write>(
    cas: &CasTable,
    nodes: &NodesTable,
    node_name: &str,
    out: &mut W,
) -> Result<usize> {
    let node = nodes.read_node(node_name)?;
    let entry = load_entry(cas, &node.entry)?;
    let count = entry.write_listing(out, &PathBuf::new())?;
    writeln!(out, "Total {count}").map_err(|e| DumbcasError::io(node_name, e))?;
    Ok(count)
}
