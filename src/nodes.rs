//! Time-partitioned index of backup roots
//!
//! Every archive run ends with one small JSON "node" that points at the
//! entry manifest in the CAS. Nodes are filed under one directory per UTC
//! month and named `<host>_<YYYY-MM-DD_HH-MM-SS>_<label>`, so two stores
//! produced on different machines compose under rsync: names never collide
//! across hosts and sort chronologically.
//!
//! `nodes/tags/<label>` always points at the most recent node for a label,
//! as a relative symlink where the platform allows it and as a plain data
//! copy otherwise. Deleting a node is a plain file removal; the space it
//! pinned in the CAS is reclaimed by the next garbage collection.

use crate::error::{DumbcasError, Result};
use crate::trash::{Trash, TRASH_NAME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::{DirEntry, WalkDir};

/// Name of the index directory under the root.
pub const NODES_NAME: &str = "nodes";

/// Subdirectory holding the per-label "latest node" pointers.
pub const TAGS_NAME: &str = "tags";

/// Give up on name-collision suffixing after this many attempts.
const MAX_NAME_ATTEMPTS: usize = 1024;

/// A single backup root: the hash of its entry manifest plus a free-form
/// comment. Serialized as `{"Entry": "...", "Comment": "..."}` with the
/// comment omitted when empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Hex SHA-1 of the serialized entry manifest in the CAS.
    #[serde(rename = "Entry")]
    pub entry: String,
    /// Free-form user comment; may be empty.
    #[serde(rename = "Comment", default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

/// On-disk index of backup roots.
#[derive(Debug)]
pub struct NodesTable {
    nodes_dir: PathBuf,
    hostname: String,
    trash: Trash,
    clock: fn() -> DateTime<Utc>,
}

impl NodesTable {
    /// Open the index under `root_dir`, creating `nodes/` if absent. The
    /// short hostname (first dot-separated component) is resolved once and
    /// baked into every node name this table allocates.
    pub fn load(root_dir: &Path) -> Result<NodesTable> {
        if root_dir.as_os_str().is_empty() || !root_dir.is_absolute() {
            return Err(DumbcasError::invalid_argument(format!(
                "index root must be an absolute path, got {:?}",
                root_dir
            )));
        }
        let nodes_dir = root_dir.join(NODES_NAME);
        fs::create_dir_all(&nodes_dir).map_err(|e| DumbcasError::io(&nodes_dir, e))?;
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let hostname = hostname
            .split('.')
            .next()
            .unwrap_or("localhost")
            .to_string();
        Ok(NodesTable {
            trash: Trash::new(&nodes_dir),
            nodes_dir,
            hostname,
            clock: Utc::now,
        })
    }

    /// Replace the clock used for node naming. Lets tests force name
    /// collisions deterministically.
    pub fn set_clock(&mut self, clock: fn() -> DateTime<Utc>) {
        self.clock = clock;
    }

    /// Index directory this table was opened on.
    pub fn dir(&self) -> &Path {
        &self.nodes_dir
    }

    /// Write `node` under the current month, derive a unique time-ordered
    /// name for it, and repoint the `label` tag at it.
    ///
    /// On a name collision the suffixes `(1)`, `(2)`, ... are tried until
    /// an exclusive create succeeds; the first successful write fixes the
    /// final name. Returns the node's relative path, `<month>/<filename>`.
    pub fn add_entry(&self, node: &Node, label: &str) -> Result<String> {
        let data = serde_json::to_vec(node)?;
        let now = (self.clock)();
        let month = now.format("%Y-%m").to_string();
        let month_dir = self.nodes_dir.join(&month);
        fs::create_dir_all(&month_dir).map_err(|e| DumbcasError::io(&month_dir, e))?;

        let base = format!("{}_{}_{}", self.hostname, now.format("%Y-%m-%d_%H-%M-%S"), label);
        for suffix in 0..MAX_NAME_ATTEMPTS {
            let name = if suffix == 0 {
                base.clone()
            } else {
                format!("{base}({suffix})")
            };
            let node_path = month_dir.join(&name);
            let mut file = match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&node_path)
            {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(DumbcasError::io(&node_path, e)),
            };
            file.write_all(&data)
                .map_err(|e| DumbcasError::io(&node_path, e))?;
            // Durability is advisory; the node is recreatable by re-running
            // the archive.
            let _ = file.sync_all();
            self.update_tag(label, &month, &name, &data)?;
            let rel = format!("{month}/{name}");
            info!("saved node {rel}");
            return Ok(rel);
        }
        Err(DumbcasError::AlreadyExists(base))
    }

    /// Point `tags/<label>` at the freshly written node, preferring a
    /// relative symlink and falling back to a data copy where symlinks are
    /// unavailable.
    fn update_tag(&self, label: &str, month: &str, name: &str, data: &[u8]) -> Result<()> {
        let tags_dir = self.nodes_dir.join(TAGS_NAME);
        fs::create_dir_all(&tags_dir).map_err(|e| DumbcasError::io(&tags_dir, e))?;
        let tag_path = tags_dir.join(label);
        let target = Path::new("..").join(month).join(name);
        let _ = fs::remove_file(&tag_path);
        if let Err(err) = symlink(&target, &tag_path) {
            warn!(
                "symlink unavailable for tag {label} ({err}), writing a data copy"
            );
            let tmp_path = tag_path.with_extension("tmp");
            fs::write(&tmp_path, data).map_err(|e| DumbcasError::io(&tmp_path, e))?;
            fs::rename(&tmp_path, &tag_path).map_err(|e| DumbcasError::io(&tag_path, e))?;
        }
        Ok(())
    }

    /// Open the node at `rel_path` for reading.
    pub fn open(&self, rel_path: &str) -> Result<File> {
        let path = self.nodes_dir.join(rel_path);
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DumbcasError::NotFound(rel_path.to_string())
            } else {
                DumbcasError::io(&path, e)
            }
        })
    }

    /// Open and decode the node at `rel_path`.
    pub fn read_node(&self, rel_path: &str) -> Result<Node> {
        let file = self.open(rel_path)?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Move the node at `rel_path` into `nodes/trash/`. The month
    /// directory is left in place; empty directories are harmless. Callers
    /// are expected to run a garbage collection afterwards.
    pub fn remove(&self, rel_path: &str) -> Result<()> {
        self.trash.put(Path::new(rel_path))
    }

    /// Lazily enumerate the relative path of every node, tags included.
    /// Directories and anything under a `trash` segment are skipped. The
    /// iterator ends early once `interrupt` is latched.
    pub fn enumerate(&self, interrupt: &crate::interrupt::Interrupt) -> NodeEnumeration<'_> {
        let walker = WalkDir::new(&self.nodes_dir)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(not_trash as fn(&DirEntry) -> bool);
        NodeEnumeration {
            nodes_dir: &self.nodes_dir,
            interrupt: interrupt.clone(),
            walker,
        }
    }
}

fn not_trash(entry: &DirEntry) -> bool {
    entry.file_name() != TRASH_NAME
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks not supported on this platform",
    ))
}

/// Lazy enumeration over the nodes of a [`NodesTable`].
pub struct NodeEnumeration<'a> {
    nodes_dir: &'a Path,
    interrupt: crate::interrupt::Interrupt,
    walker: walkdir::FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>,
}

impl Iterator for NodeEnumeration<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.interrupt.is_set() {
                return None;
            }
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.nodes_dir.to_path_buf());
                    return Some(Err(DumbcasError::io(path, e.into())));
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            match entry.path().strip_prefix(self.nodes_dir) {
                Ok(rel) => return Some(Ok(rel.to_string_lossy().into_owned())),
                Err(_) => continue,
            }
        }
    }
}
