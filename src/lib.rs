//! # Dumbcas - content-addressed local backups
//!
//! A deliberately dumb backup engine: every file's identity is the hex
//! SHA-1 of its bytes, so identical content is stored exactly once no
//! matter where it appeared, and the whole store is plain files that rsync
//! happily copies between machines.
//!
//! ## Overview
//!
//! Two on-disk tables live under a store root:
//!
//! - the **CAS** ([`CasTable`]): opaque objects fanned into 4096 prefix
//!   buckets, named by their own SHA-1;
//! - the **nodes** index ([`NodesTable`]): one small JSON file per backup
//!   run, filed by month and named by host, timestamp and label, pointing
//!   at an [`Entry`] manifest stored in the CAS.
//!
//! Archiving is a three-stage pipeline (enumerate, hash, store) with a
//! persistent per-user [`Cache`] that collapses unchanged files to a
//! single `stat` call. Integrity is maintained by [`fsck`] (full re-hash,
//! quarantine of anything suspect) and [`gc`] (mark from nodes, sweep the
//! CAS); neither ever deletes bytes, they only move them to a trash
//! folder.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dumbcas::{ArchiveRequest, Cache, CasTable, Interrupt, NodesTable};
//! use std::path::{Path, PathBuf};
//!
//! # fn main() -> dumbcas::Result<()> {
//! let root = Path::new("/backups/store");
//! let cas = CasTable::open_or_create(root)?;
//! let nodes = NodesTable::load(root)?;
//! let (mut cache, cache_error) = Cache::load();
//! if let Some(err) = cache_error {
//!     eprintln!("hash cache unavailable: {err}");
//! }
//!
//! let request = ArchiveRequest {
//!     inputs: vec![PathBuf::from("/home/user/documents")],
//!     label: "documents".to_string(),
//!     comment: "weekly".to_string(),
//! };
//! let interrupt = Interrupt::new();
//! let outcome = dumbcas::run_archive(&cas, &nodes, &mut cache, &request, None, &interrupt)?;
//! println!("saved node {}", outcome.node);
//!
//! let restored = dumbcas::restore(&cas, &nodes, &outcome.node, Path::new("/tmp/out"), &interrupt)?;
//! println!("restored {restored} files");
//! # Ok(())
//! # }
//! ```
//!
//! ## Non-goals
//!
//! No compression, no encryption, no permission or ownership
//! preservation, no chunking of large files, and a single-process writer
//! per store. The format is the feature: it stays simple enough to
//! inspect, repair and copy with standard tools.

pub mod archive;
pub mod cache;
pub mod cas;
pub mod entry;
pub mod error;
pub mod fsck;
pub mod gc;
pub mod hashing;
pub mod interrupt;
pub mod nodes;
pub mod restore;
pub mod trash;

// Re-export main types for convenience
pub use archive::{
    read_input_list, run_archive, ArchiveOutcome, ArchiveRequest, ArchiveStats, ProgressFn,
    StatsSnapshot,
};
pub use cache::{Cache, CacheEntry};
pub use cas::{AddResult, CasTable};
pub use entry::{info, load_entry, Entry};
pub use error::{DumbcasError, Result};
pub use fsck::{fsck, FsckReport};
pub use gc::{gc, GcReport};
pub use interrupt::Interrupt;
pub use nodes::{Node, NodesTable};
pub use restore::restore;
pub use trash::Trash;

use std::path::Path;
use tracing::warn;

/// Open both tables under `root`.
///
/// When the store is marked integrity-suspect, mutating commands should
/// refuse to run until an fsck completed; pass `bypass_fsck` for the
/// read-only and repair operations that are allowed to proceed with a
/// warning.
pub fn open_store(root: &Path, bypass_fsck: bool) -> Result<(CasTable, NodesTable)> {
    let cas = CasTable::open_or_create(root)?;
    if cas.fsck_bit() {
        if !bypass_fsck {
            return Err(DumbcasError::corrupted(
                "store is marked for fsck; run fsck first",
            ));
        }
        warn!("store is marked for fsck");
    }
    let nodes = NodesTable::load(root)?;
    Ok((cas, nodes))
}

#[cfg(test)]
mod tests;
