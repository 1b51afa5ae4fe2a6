//! Garbage collection: mark from nodes, sweep the CAS
//!
//! Deleting a node only removes the pointer; the objects it pinned stay in
//! the store until a collection walks every surviving node, marks every
//! hash reachable through its entry manifest, and quarantines the rest.

use crate::cas::CasTable;
use crate::entry::load_entry;
use crate::error::{DumbcasError, Result};
use crate::interrupt::Interrupt;
use crate::nodes::{Node, NodesTable};
use std::collections::HashMap;
use tracing::info;

/// Tally of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Objects present in the store before the sweep.
    pub objects: usize,
    /// Objects reachable from at least one node.
    pub reachable: usize,
    /// Orphans moved to the trash.
    pub swept: usize,
}

/// Collect every object not reachable from the node index.
///
/// A failure to load any node or entry manifest marks the store as
/// fsck-needed and aborts the collection; sweeping with an incomplete root
/// set would destroy live data. A hash referenced by a manifest but absent
/// from the store is not an error here; it surfaces when a read fails.
pub fn gc(cas: &CasTable, nodes: &NodesTable, interrupt: &Interrupt) -> Result<GcReport> {
    let mut reachable: HashMap<String, bool> = HashMap::new();
    for item in cas.enumerate(interrupt) {
        reachable.insert(item?, false);
    }
    info!("found {} objects", reachable.len());

    let node_names: Vec<String> = nodes
        .enumerate(interrupt)
        .collect::<Result<Vec<_>>>()
        .map_err(|err| {
            cas.set_fsck_bit();
            err
        })?;
    for name in node_names {
        interrupt.check()?;
        mark_node(cas, nodes, &name, &mut reachable).map_err(|err| {
            cas.set_fsck_bit();
            err
        })?;
    }
    interrupt.check()?;

    let orphans: Vec<&String> = reachable
        .iter()
        .filter(|(_, marked)| !**marked)
        .map(|(hash, _)| hash)
        .collect();
    info!("found {} orphans", orphans.len());
    let mut report = GcReport {
        objects: reachable.len(),
        reachable: reachable.len() - orphans.len(),
        swept: 0,
    };
    for orphan in orphans {
        cas.remove(orphan).map_err(|err| {
            cas.set_fsck_bit();
            err
        })?;
        report.swept += 1;
    }
    Ok(report)
}

fn mark_node(
    cas: &CasTable,
    nodes: &NodesTable,
    name: &str,
    reachable: &mut HashMap<String, bool>,
) -> Result<()> {
    let node: Node = nodes
        .read_node(name)
        .map_err(|err| DumbcasError::corrupted(format!("node {name}: {err}")))?;
    let entry = load_entry(cas, &node.entry)?;
    if let Some(marked) = reachable.get_mut(&node.entry) {
        *marked = true;
    }
    entry.visit_hashes(&mut |hash| {
        if let Some(marked) = reachable.get_mut(hash) {
            *marked = true;
        }
    });
    Ok(())
}
