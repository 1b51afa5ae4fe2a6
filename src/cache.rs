//! Persistent incremental-hash cache
//!
//! Rehashing an unchanged multi-gigabyte tree on every backup would defeat
//! the point of incremental archives, so the hasher keeps a per-user map
//! from absolute file path to the last observed `(size, mtime, sha1)`. A
//! record is trusted only when size and mtime both still match on disk; any
//! deviation forces a rehash.
//!
//! The cache is serialized with bincode rather than JSON: it is read and
//! written whole, must load fast for large trees, and never needs to be
//! portable across processes. Losing it costs one slow backup, so a file
//! that fails to decode is silently replaced by an empty cache.

use crate::error::{DumbcasError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Per-user directory holding the cache file.
pub const CACHE_DIR_NAME: &str = ".dumbcas";

/// Cache file name; the extension reflects the binary codec.
pub const CACHE_FILE_NAME: &str = "cache.bin";

/// Entries older than this are pruned on save.
const PRUNE_AFTER_SECS: i64 = 365 * 24 * 60 * 60;

/// One cached observation of a file, or one directory level of the tree.
/// The recursive shape is much more compact than a flat path list for deep
/// trees.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Last known hex SHA-1; empty for directory levels.
    pub sha1: String,
    /// Last known file size.
    pub size: u64,
    /// Last known mtime, seconds since epoch.
    pub timestamp: i64,
    /// Wall clock of the most recent confirmation, seconds since epoch.
    pub last_tested: i64,
    /// Child name to child record.
    pub files: BTreeMap<String, CacheEntry>,
}

impl CacheEntry {
    /// Total recursive node count, this node included.
    pub fn count_members(&self) -> usize {
        1 + self.files.values().map(CacheEntry::count_members).sum::<usize>()
    }

    /// Drop every subtree whose whole membership went untested since
    /// `cutoff`.
    fn prune_older_than(&mut self, cutoff: i64) {
        self.files.retain(|_, child| child.last_tested >= cutoff);
        for child in self.files.values_mut() {
            child.prune_older_than(cutoff);
        }
    }
}

/// The in-memory cache tree plus the file it round-trips through.
#[derive(Debug)]
pub struct Cache {
    root: CacheEntry,
    path: Option<PathBuf>,
}

impl Cache {
    /// Load the per-user cache from `<home>/.dumbcas/cache.bin`.
    ///
    /// Never fails hard: with no resolvable home directory, an unreadable
    /// file, or a stale format, an empty in-memory cache is returned and
    /// the underlying error comes back alongside it for the caller to log.
    pub fn load() -> (Cache, Option<DumbcasError>) {
        match dirs::home_dir() {
            Some(home) => Cache::load_from(&home.join(CACHE_DIR_NAME)),
            None => {
                warn!("no home directory; hash cache disabled for this run");
                let cache = Cache {
                    root: CacheEntry::default(),
                    path: None,
                };
                (
                    cache,
                    Some(DumbcasError::invalid_argument("no home directory")),
                )
            }
        }
    }

    /// Load the cache living in `cache_dir`, creating the directory if
    /// needed. Same contract as [`Cache::load`]; used directly by tests.
    pub fn load_from(cache_dir: &Path) -> (Cache, Option<DumbcasError>) {
        let mut cache = Cache {
            root: CacheEntry::default(),
            path: None,
        };
        if let Err(err) = fs::create_dir_all(cache_dir) {
            warn!(
                "failed to create {}: {err}; hash cache disabled for this run",
                cache_dir.display()
            );
            return (cache, Some(DumbcasError::io(cache_dir, err)));
        }
        let file = cache_dir.join(CACHE_FILE_NAME);
        let mut load_error = None;
        match fs::read(&file) {
            Ok(data) if !data.is_empty() => {
                match bincode::serde::decode_from_slice::<CacheEntry, _>(
                    &data,
                    bincode::config::standard(),
                ) {
                    Ok((root, _)) => {
                        info!("loaded {} entries from the cache", root.count_members() - 1);
                        cache.root = root;
                    }
                    Err(err) => {
                        // A stale or corrupt cache only costs one slow run.
                        warn!("failed to decode {}: {err}; starting empty", file.display());
                        load_error = Some(err.into());
                    }
                }
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!("failed to read {}: {err}; starting empty", file.display());
                load_error = Some(DumbcasError::io(&file, err));
            }
        }
        cache.path = Some(file);
        (cache, load_error)
    }

    /// Walk down to the record for `abs_path`, creating missing levels,
    /// and stamp every visited level as tested `now`.
    pub fn find_or_create(&mut self, abs_path: &Path, now: i64) -> &mut CacheEntry {
        let mut current = &mut self.root;
        current.last_tested = now;
        for component in abs_path.components() {
            let name = match component {
                Component::Normal(name) => name.to_string_lossy().into_owned(),
                Component::RootDir | Component::CurDir => continue,
                // Keep drive prefixes and parent refs addressable as-is.
                other => other.as_os_str().to_string_lossy().into_owned(),
            };
            current = current.files.entry(name).or_default();
            current.last_tested = now;
        }
        current
    }

    /// Total recursive node count; used for progress reporting.
    pub fn count_members(&self) -> usize {
        self.root.count_members()
    }

    /// Prune year-old records and rewrite the cache file atomically
    /// (temp + rename). No-op for a memory-only cache.
    pub fn save(&mut self, now: i64) -> Result<()> {
        let Some(file) = self.path.clone() else {
            return Ok(());
        };
        self.root.prune_older_than(now - PRUNE_AFTER_SECS);
        info!("saving cache: {} entries", self.count_members() - 1);
        let data = bincode::serde::encode_to_vec(&self.root, bincode::config::standard())?;
        if data.len() < 2 {
            // Even an empty tree encodes to several bytes; anything
            // smaller means the encoder produced garbage.
            warn!("cache encoded to {} bytes, refusing to write", data.len());
            return Err(DumbcasError::Bincode(format!(
                "implausibly small cache encoding ({} bytes)",
                data.len()
            )));
        }
        let tmp = file.with_extension("tmp");
        fs::write(&tmp, &data).map_err(|e| DumbcasError::io(&tmp, e))?;
        fs::rename(&tmp, &file).map_err(|e| DumbcasError::io(&file, e))?;
        Ok(())
    }

    /// Flush and drop the cache.
    pub fn close(mut self, now: i64) {
        if let Err(err) = self.save(now) {
            warn!("failed to save the hash cache: {err}");
        }
    }
}
