//! Quarantine folder for rejected paths
//!
//! A `Trash` moves suspicious or unwanted files out of the live tree by
//! renaming them into a `trash/` subdirectory of its managed root, keeping
//! the relative layout intact. Bytes survive operator and fsck mistakes;
//! nothing in this module ever deletes data.

use crate::error::{DumbcasError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Name of the quarantine subdirectory.
pub const TRASH_NAME: &str = "trash";

/// Lazily created quarantine folder under a managed directory.
#[derive(Debug)]
pub struct Trash {
    root_dir: PathBuf,
    trash_dir: PathBuf,
    created: AtomicBool,
}

impl Trash {
    /// A trash rooted at `root_dir/trash`. Nothing is created until the
    /// first move.
    pub fn new(root_dir: &Path) -> Trash {
        Trash {
            root_dir: root_dir.to_path_buf(),
            trash_dir: root_dir.join(TRASH_NAME),
            created: AtomicBool::new(false),
        }
    }

    /// The quarantine directory, whether or not it exists yet.
    pub fn dir(&self) -> &Path {
        &self.trash_dir
    }

    /// Move `rel_path` (relative to the managed root) into the trash,
    /// recreating intermediate directories so the layout is preserved.
    pub fn put(&self, rel_path: &Path) -> Result<()> {
        if !self.created.swap(true, Ordering::SeqCst) {
            fs::create_dir_all(&self.trash_dir)
                .map_err(|e| DumbcasError::io(&self.trash_dir, e))?;
            info!("created trash at {}", self.trash_dir.display());
        }
        let src = self.root_dir.join(rel_path);
        let dst = self.trash_dir.join(rel_path);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| DumbcasError::io(parent, e))?;
        }
        info!("quarantining {}", src.display());
        fs::rename(&src, &dst).map_err(|e| DumbcasError::io(&src, e))
    }
}
