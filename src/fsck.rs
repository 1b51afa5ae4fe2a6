//! Full-store integrity verification
//!
//! Fsck re-derives every object's name from its bytes and validates every
//! node, quarantining whatever can be recovered safely. It is the only
//! operation allowed to clear the persistent "fsck needed" flag.

use crate::cas::CasTable;
use crate::error::{DumbcasError, Result};
use crate::hashing::{self, is_valid_hash};
use crate::interrupt::Interrupt;
use crate::nodes::{Node, NodesTable};
use std::path::Path;
use tracing::{info, warn};

/// Tally of one fsck run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsckReport {
    /// Objects whose hash was re-verified.
    pub scanned: usize,
    /// Objects whose bytes no longer matched their name; quarantined.
    pub corrupted_objects: usize,
    /// Nodes that failed to load or referenced a malformed hash;
    /// quarantined.
    pub corrupted_nodes: usize,
}

/// Scan the whole store, then the node index.
///
/// Corrupted objects and nodes are moved to the trash and counted, never
/// deleted. A read error while re-hashing is fatal for the pass: at that
/// point the disk itself is suspect and the operator should preserve any
/// secondary copy. On successful completion the fsck flag is cleared.
pub fn fsck(cas: &CasTable, nodes: &NodesTable, interrupt: &Interrupt) -> Result<FsckReport> {
    let mut report = FsckReport::default();

    for item in cas.enumerate(interrupt) {
        let hash = item?;
        let mut file = cas.open(&hash)?;
        let actual = hashing::hash_reader(&mut file, Path::new(&hash), interrupt)?;
        if actual != hash {
            warn!("found invalid object, {hash} hashes to {actual}");
            cas.remove(&hash)?;
            report.corrupted_objects += 1;
        }
        report.scanned += 1;
    }

    let node_names: Vec<String> = nodes
        .enumerate(interrupt)
        .collect::<Result<Vec<_>>>()?;
    for name in node_names {
        interrupt.check()?;
        if let Err(err) = check_node(nodes, &name) {
            warn!("found invalid node {name}: {err}");
            nodes.remove(&name)?;
            report.corrupted_nodes += 1;
        }
    }

    interrupt.check()?;
    cas.clear_fsck_bit();
    info!(
        "scanned {} objects; found {} corrupted, {} invalid nodes",
        report.scanned, report.corrupted_objects, report.corrupted_nodes
    );
    Ok(report)
}

fn check_node(nodes: &NodesTable, name: &str) -> Result<()> {
    let node: Node = nodes.read_node(name)?;
    if !is_valid_hash(&node.entry) {
        return Err(DumbcasError::corrupted(format!(
            "node references malformed entry {:?}",
            node.entry
        )));
    }
    Ok(())
}
