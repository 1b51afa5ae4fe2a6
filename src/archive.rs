//! Three-stage archival pipeline
//!
//! An archive run is a producer/consumer chain of three stages joined by
//! bounded queues:
//!
//! ```text
//!   inputs --> enumerator --FileItem--> hasher --HashedItem--> archiver --entry hash--> coordinator
//! ```
//!
//! - the **enumerator** walks the input roots and emits one record per
//!   regular file;
//! - the **hasher** consults the incremental cache and only re-reads files
//!   whose size or mtime changed;
//! - the **archiver** streams unique bytes into the CAS while weaving the
//!   entry manifest, then content-addresses the manifest itself.
//!
//! Backpressure is the queues' blocking sends; each stage owns its sender
//! and closes the queue by dropping it on every exit path. A stage that
//! stops early (interrupt, error) drops its receiver too, which unblocks
//! and winds down the stage upstream of it. Per-item failures are counted
//! and logged, never fatal: one unreadable file must not abort a
//! multi-hour backup.
//!
//! The coordinator multiplexes the archiver's single-value output channel
//! with a five-second progress tick and the interrupt token, then files a
//! new node referencing the finished manifest.

use crate::cache::Cache;
use crate::cas::{AddResult, CasTable};
use crate::entry::Entry;
use crate::error::{DumbcasError, Result};
use crate::hashing;
use crate::interrupt::Interrupt;
use crate::nodes::{Node, NodesTable};
use chrono::Utc;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Queue capacity between stages, in records.
const PIPE_CAPACITY: usize = 128 * 1024;

/// How often the coordinator samples the counters.
const PROGRESS_TICK: Duration = Duration::from_secs(5);

/// One file discovered by the enumerator.
#[derive(Debug, Clone)]
struct FileItem {
    full_path: PathBuf,
    rel_path: PathBuf,
    size: u64,
    mtime: i64,
}

/// One file with its content hash resolved.
#[derive(Debug, Clone)]
struct HashedItem {
    full_path: PathBuf,
    rel_path: PathBuf,
    sha1: String,
    size: u64,
}

/// Aggregated pipeline counters. Every field is atomic so the coordinator
/// can sample them without locking the stages.
#[derive(Debug, Default)]
pub struct ArchiveStats {
    errors: AtomicU64,
    found: AtomicU64,
    total_size: AtomicU64,
    hashed: AtomicU64,
    bytes_hashed: AtomicU64,
    not_hashed: AtomicU64,
    bytes_not_hashed: AtomicU64,
    archived: AtomicU64,
    bytes_archived: AtomicU64,
    not_archived: AtomicU64,
    bytes_not_archived: AtomicU64,
}

impl ArchiveStats {
    /// Value-copy of the counters. The loads are independent, so the copy
    /// may be internally inconsistent; readers must not assume cross-field
    /// consistency.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            errors: self.errors.load(Ordering::Relaxed),
            found: self.found.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
            hashed: self.hashed.load(Ordering::Relaxed),
            bytes_hashed: self.bytes_hashed.load(Ordering::Relaxed),
            not_hashed: self.not_hashed.load(Ordering::Relaxed),
            bytes_not_hashed: self.bytes_not_hashed.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            bytes_archived: self.bytes_archived.load(Ordering::Relaxed),
            not_archived: self.not_archived.load(Ordering::Relaxed),
            bytes_not_archived: self.bytes_not_archived.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ArchiveStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Per-item failures across all stages.
    pub errors: u64,
    /// Files discovered by the enumerator.
    pub found: u64,
    /// Total bytes of all discovered files.
    pub total_size: u64,
    /// Files whose content was actually read and hashed.
    pub hashed: u64,
    /// Bytes read by the hasher.
    pub bytes_hashed: u64,
    /// Files served from the incremental cache.
    pub not_hashed: u64,
    /// Bytes skipped thanks to the cache.
    pub bytes_not_hashed: u64,
    /// Objects newly written to the store.
    pub archived: u64,
    /// Bytes newly written to the store.
    pub bytes_archived: u64,
    /// Objects already present (deduplicated).
    pub not_archived: u64,
    /// Bytes deduplicated.
    pub bytes_not_archived: u64,
}

/// Progress callback, invoked with a fresh snapshot whenever the counters
/// changed between two coordinator ticks.
pub type ProgressFn = Arc<dyn Fn(&StatsSnapshot) + Send + Sync>;

/// What to archive: absolute input paths, a node label and a comment.
#[derive(Debug, Clone, Default)]
pub struct ArchiveRequest {
    /// Absolute paths of files or directories to back up.
    pub inputs: Vec<PathBuf>,
    /// Label for the node name and its tag.
    pub label: String,
    /// Free-form comment embedded in the node.
    pub comment: String,
}

/// Result of a completed archive run.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    /// Relative path of the new node, `<month>/<filename>`.
    pub node: String,
    /// Hash of the entry manifest in the CAS.
    pub entry_hash: String,
    /// Final counter values. `errors > 0` means partial success.
    pub stats: StatsSnapshot,
}

/// Parse a ".toArchive" list file: one path per line, blank lines skipped,
/// relative paths resolved against the file's directory. The list file
/// itself is appended so the backup stays self-describing, and its base
/// name becomes the node label. An empty list therefore still archives one
/// object.
pub fn read_input_list(path: &Path) -> Result<ArchiveRequest> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| DumbcasError::io(path, e))?
            .join(path)
    };
    let text = fs::read_to_string(&abs).map_err(|e| DumbcasError::io(&abs, e))?;
    let base_dir = abs.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut inputs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let item = Path::new(line);
        inputs.push(if item.is_absolute() {
            item.to_path_buf()
        } else {
            base_dir.join(item)
        });
    }
    inputs.push(abs.clone());
    let label = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DumbcasError::invalid_argument("input list has no file name"))?;
    info!("found {} entries to backup in {}", inputs.len() - 1, abs.display());
    Ok(ArchiveRequest {
        inputs,
        label,
        comment: String::new(),
    })
}

fn mtime_secs(modified: std::io::Result<SystemTime>) -> i64 {
    modified
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Stage 1: walk the input roots and emit one record per regular file.
/// Directories are never emitted themselves; a single-file input is
/// emitted under its base name.
fn enumerate_stage(
    inputs: &[PathBuf],
    output: SyncSender<FileItem>,
    stats: &ArchiveStats,
    interrupt: &Interrupt,
) {
    for input in inputs {
        if interrupt.is_set() {
            return;
        }
        let metadata = match fs::metadata(input) {
            Ok(m) => m,
            Err(err) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!("failed to stat {}: {err}", input.display());
                continue;
            }
        };
        if !metadata.is_dir() {
            let rel_path = match input.file_name() {
                Some(name) => PathBuf::from(name),
                None => continue,
            };
            let item = FileItem {
                full_path: input.clone(),
                rel_path,
                size: metadata.len(),
                mtime: mtime_secs(metadata.modified()),
            };
            stats.found.fetch_add(1, Ordering::Relaxed);
            stats.total_size.fetch_add(item.size, Ordering::Relaxed);
            if output.send(item).is_err() {
                return;
            }
            continue;
        }
        for dirent in WalkDir::new(input).min_depth(1).follow_links(false) {
            if interrupt.is_set() {
                return;
            }
            let dirent = match dirent {
                Ok(d) => d,
                Err(err) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("failed to walk {}: {err}", input.display());
                    continue;
                }
            };
            if dirent.file_type().is_dir() {
                continue;
            }
            let metadata = match dirent.metadata() {
                Ok(m) => m,
                Err(err) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("failed to stat {}: {err}", dirent.path().display());
                    continue;
                }
            };
            let rel_path = match dirent.path().strip_prefix(input) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let item = FileItem {
                full_path: dirent.path().to_path_buf(),
                rel_path,
                size: metadata.len(),
                mtime: mtime_secs(metadata.modified()),
            };
            stats.found.fetch_add(1, Ordering::Relaxed);
            stats.total_size.fetch_add(item.size, Ordering::Relaxed);
            if output.send(item).is_err() {
                return;
            }
        }
    }
}

/// Stage 2: resolve each file's SHA-1, reusing the cache when `(size,
/// mtime)` still match and updating it when they do not.
fn hash_stage(
    cache: &mut Cache,
    input: Receiver<FileItem>,
    output: SyncSender<HashedItem>,
    stats: &ArchiveStats,
    interrupt: &Interrupt,
) {
    while let Ok(item) = input.recv() {
        if interrupt.is_set() {
            return;
        }
        let now = Utc::now().timestamp();
        let cached = cache.find_or_create(&item.full_path, now);
        let sha1 = if !cached.sha1.is_empty()
            && cached.size == item.size
            && cached.timestamp == item.mtime
        {
            stats.not_hashed.fetch_add(1, Ordering::Relaxed);
            stats.bytes_not_hashed.fetch_add(item.size, Ordering::Relaxed);
            cached.sha1.clone()
        } else {
            let digest = match hashing::hash_file(&item.full_path, interrupt) {
                Ok(d) => d,
                Err(DumbcasError::Interrupted) => return,
                Err(err) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("failed to hash {}: {err}", item.full_path.display());
                    continue;
                }
            };
            cached.sha1 = digest.clone();
            cached.size = item.size;
            cached.timestamp = item.mtime;
            cached.last_tested = now;
            stats.hashed.fetch_add(1, Ordering::Relaxed);
            stats.bytes_hashed.fetch_add(item.size, Ordering::Relaxed);
            digest
        };
        let hashed = HashedItem {
            full_path: item.full_path,
            rel_path: item.rel_path,
            sha1,
            size: item.size,
        };
        if output.send(hashed).is_err() {
            return;
        }
    }
}

/// Stage 3: weave the entry manifest and stream unique bytes into the
/// store, then content-address the manifest itself and hand its hash to
/// the coordinator.
fn archive_stage(
    cas: &CasTable,
    input: Receiver<HashedItem>,
    output: SyncSender<Result<String>>,
    stats: &ArchiveStats,
    interrupt: &Interrupt,
) {
    let mut root = Entry::default();
    while let Ok(item) = input.recv() {
        if interrupt.is_set() {
            return;
        }
        let leaf = root.descend(&item.rel_path);
        leaf.sha1 = item.sha1.clone();
        leaf.size = item.size;
        let mut source = match File::open(&item.full_path) {
            Ok(f) => f,
            Err(err) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!("failed to open {}: {err}", item.full_path.display());
                continue;
            }
        };
        match cas.add_entry(&mut source, &item.sha1) {
            Ok(AddResult::Added) => {
                stats.archived.fetch_add(1, Ordering::Relaxed);
                stats.bytes_archived.fetch_add(item.size, Ordering::Relaxed);
            }
            Ok(AddResult::AlreadyPresent) => {
                stats.not_archived.fetch_add(1, Ordering::Relaxed);
                stats.bytes_not_archived.fetch_add(item.size, Ordering::Relaxed);
            }
            Err(err) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!("failed to store {}: {err}", item.full_path.display());
            }
        }
    }
    if interrupt.is_set() {
        return;
    }
    // The manifest is an object like any other; archiving it gives the
    // node a content-addressed root to point at.
    let result = store_manifest(cas, &root, stats);
    let _ = output.send(result);
}

fn store_manifest(cas: &CasTable, root: &Entry, stats: &ArchiveStats) -> Result<String> {
    debug!("archiving the entry manifest ({} members)", root.count());
    let data = serde_json::to_vec(root)?;
    let (hash, result) = cas.add_bytes(&data)?;
    match result {
        AddResult::Added => {
            stats.archived.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_archived
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        AddResult::AlreadyPresent => {
            stats.not_archived.fetch_add(1, Ordering::Relaxed);
            stats
                .bytes_not_archived
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
    }
    Ok(hash)
}

/// Run a whole archive: start the three stages, keep the caller informed
/// through `progress`, and on success file a new node named after
/// `request.label`.
///
/// Per-item failures are counted in the returned snapshot, not raised; the
/// node is written whenever the manifest landed in the store and no
/// interrupt was observed.
pub fn run_archive(
    cas: &CasTable,
    nodes: &NodesTable,
    cache: &mut Cache,
    request: &ArchiveRequest,
    progress: Option<ProgressFn>,
    interrupt: &Interrupt,
) -> Result<ArchiveOutcome> {
    if request.label.is_empty() {
        return Err(DumbcasError::invalid_argument("archive label is empty"));
    }
    for input in &request.inputs {
        if !input.is_absolute() {
            return Err(DumbcasError::invalid_argument(format!(
                "input {:?} is not absolute",
                input
            )));
        }
    }
    info!(
        "archiving {} inputs as {:?}",
        request.inputs.len(),
        request.label
    );

    let stats = ArchiveStats::default();
    let entry_result = {
        let stats = &stats;
        thread::scope(|s| {
            let (file_tx, file_rx) = sync_channel(PIPE_CAPACITY);
            let (hashed_tx, hashed_rx) = sync_channel(PIPE_CAPACITY);
            let (entry_tx, entry_rx) = sync_channel::<Result<String>>(1);

            let enum_interrupt = interrupt.clone();
            let inputs = request.inputs.as_slice();
            s.spawn(move || enumerate_stage(inputs, file_tx, stats, &enum_interrupt));

            let hash_interrupt = interrupt.clone();
            let cache = &mut *cache;
            s.spawn(move || hash_stage(cache, file_rx, hashed_tx, stats, &hash_interrupt));

            let archive_interrupt = interrupt.clone();
            s.spawn(move || archive_stage(cas, hashed_rx, entry_tx, stats, &archive_interrupt));

            // Multiplex the manifest channel with the progress tick. The
            // stages watch the interrupt themselves; the timeout keeps this
            // loop responsive to it as well.
            let mut last = stats.snapshot();
            loop {
                match entry_rx.recv_timeout(PROGRESS_TICK) {
                    Ok(result) => break Some(result),
                    Err(RecvTimeoutError::Timeout) => {
                        let current = stats.snapshot();
                        if current != last {
                            if let Some(callback) = &progress {
                                callback(&current);
                            }
                            last = current;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break None,
                }
            }
        })
    };

    let snapshot = stats.snapshot();
    if let Some(callback) = &progress {
        callback(&snapshot);
    }
    // Persist what the hasher learned even when the run is cut short;
    // losing it only makes the next backup slower.
    cache.save(Utc::now().timestamp())?;

    interrupt.check()?;
    let entry_hash = entry_result.unwrap_or(Err(DumbcasError::Interrupted))?;
    let node = Node {
        entry: entry_hash.clone(),
        comment: request.comment.clone(),
    };
    let node_name = nodes.add_entry(&node, &request.label)?;
    info!(
        "archived {} files ({} bytes), skipped {} ({} bytes), {} errors",
        snapshot.archived,
        snapshot.bytes_archived,
        snapshot.not_archived,
        snapshot.bytes_not_archived,
        snapshot.errors
    );
    Ok(ArchiveOutcome {
        node: node_name,
        entry_hash,
        stats: snapshot,
    })
}
