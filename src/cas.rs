//! Content-addressed object table
//!
//! The `CasTable` stores opaque byte streams keyed by the lowercase hex
//! SHA-1 of their contents. Objects are fanned out into 4096 prefix buckets
//! (`cas/<hex[0:3]>/<hex[3:40]>`) so no single directory grows large enough
//! to stress filesystem lookup, and all buckets are precreated so writes
//! never race on `mkdir`.
//!
//! ## Layout
//!
//! ```text
//! <root>/cas/
//!   000/ .. fff/        4096 prefix buckets, one file per object
//!   need_fsck           presence-only integrity flag
//!   trash/              quarantined objects, same bucket shape
//! ```
//!
//! Writes use create-exclusive semantics: either the final file is present
//! with full contents or it is not present at all. The caller is trusted to
//! pass the correct hash; verification is fsck's job. Anything found under
//! `cas/` that does not match the naming scheme is quarantined on sight and
//! the fsck flag is raised.

use crate::error::{DumbcasError, Result};
use crate::hashing::{self, HASH_LENGTH};
use crate::interrupt::Interrupt;
use crate::trash::{Trash, TRASH_NAME};
use std::fs::{self, File, OpenOptions, ReadDir};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the store directory under the root.
pub const CAS_NAME: &str = "cas";

/// Presence-only flag file signalling "integrity suspect".
const NEED_FSCK_NAME: &str = "need_fsck";

/// Number of leading hex characters used as the bucket name. Three gives
/// 16^3 = 4096 buckets, enough to keep per-bucket fan-out in the tractable
/// range for repositories up to tens of millions of objects.
pub const PREFIX_LENGTH: usize = 3;

/// Result of adding an object to the store. A hash that is already present
/// is left untouched and is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// The object was written.
    Added,
    /// An object with this hash already exists; the store is unchanged.
    AlreadyPresent,
}

/// On-disk content-addressed object store.
#[derive(Debug)]
pub struct CasTable {
    root_dir: PathBuf,
    cas_dir: PathBuf,
    trash: Trash,
}

impl CasTable {
    /// Open the store under `root_dir`, creating the directory structure
    /// (including every prefix bucket) on first use.
    ///
    /// # Errors
    ///
    /// [`DumbcasError::InvalidArgument`] when `root_dir` is empty or not
    /// absolute; I/O errors otherwise.
    pub fn open_or_create(root_dir: &Path) -> Result<CasTable> {
        if root_dir.as_os_str().is_empty() || !root_dir.is_absolute() {
            return Err(DumbcasError::invalid_argument(format!(
                "store root must be an absolute path, got {:?}",
                root_dir
            )));
        }
        let cas_dir = root_dir.join(CAS_NAME);
        let fresh = !cas_dir.is_dir();
        fs::create_dir_all(&cas_dir).map_err(|e| DumbcasError::io(&cas_dir, e))?;
        if fresh {
            // Precreate the whole prefix space so writers never need to
            // test for their bucket.
            for i in 0..(1usize << (PREFIX_LENGTH * 4)) {
                let bucket = cas_dir.join(format!("{:0width$x}", i, width = PREFIX_LENGTH));
                match fs::create_dir(&bucket) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(DumbcasError::io(&bucket, e)),
                }
            }
            info!("initialized object store at {}", cas_dir.display());
        }
        Ok(CasTable {
            root_dir: root_dir.to_path_buf(),
            trash: Trash::new(&cas_dir),
            cas_dir,
        })
    }

    /// Store root this table was opened on.
    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// Bucketed relative path of `hash`, without validation.
    fn rel_path(hash: &str) -> PathBuf {
        Path::new(&hash[..PREFIX_LENGTH]).join(&hash[PREFIX_LENGTH..])
    }

    /// Absolute object path for a validated hash.
    fn object_path(&self, hash: &str) -> Result<PathBuf> {
        if !hashing::is_valid_hash(hash) {
            return Err(DumbcasError::invalid_argument(format!(
                "{hash:?} is not a valid object name"
            )));
        }
        Ok(self.cas_dir.join(Self::rel_path(hash)))
    }

    /// Write the bytes of `source` to the object named `hash`.
    ///
    /// Create-exclusive semantics make the add atomic for a single-process
    /// writer: a concurrent or previous add of the same hash yields
    /// [`AddResult::AlreadyPresent`] and leaves the existing object
    /// unchanged. The hash is trusted, not verified.
    pub fn add_entry<R: Read>(&self, source: &mut R, hash: &str) -> Result<AddResult> {
        let dst = self.object_path(hash)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&dst) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Ok(AddResult::AlreadyPresent);
            }
            Err(e) => return Err(DumbcasError::io(&dst, e)),
        };
        if let Err(e) = io::copy(source, &mut file) {
            // Never leave a half-written object behind.
            drop(file);
            let _ = fs::remove_file(&dst);
            return Err(DumbcasError::io(&dst, e));
        }
        Ok(AddResult::Added)
    }

    /// Hash an in-memory buffer and store it in one call.
    pub fn add_bytes(&self, data: &[u8]) -> Result<(String, AddResult)> {
        let hash = hashing::hash_bytes(data);
        let result = self.add_entry(&mut io::Cursor::new(data), &hash)?;
        Ok((hash, result))
    }

    /// Open the object named `hash` for reading, positioned at 0.
    pub fn open(&self, hash: &str) -> Result<File> {
        let path = self.object_path(hash)?;
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DumbcasError::NotFound(hash.to_string())
            } else {
                DumbcasError::io(&path, e)
            }
        })
    }

    /// Move the object named `hash` into `cas/trash/`, preserving the
    /// bucket layout.
    pub fn remove(&self, hash: &str) -> Result<()> {
        // Validate before touching the filesystem.
        self.object_path(hash)?;
        self.trash.put(&Self::rel_path(hash))
    }

    /// Lazily enumerate every object in the store.
    ///
    /// Files and directories that do not match the naming scheme are moved
    /// to the trash as they are encountered and the fsck flag is set; they
    /// are not yielded. Ordering is filesystem-defined. The iterator ends
    /// early once `interrupt` is latched.
    pub fn enumerate(&self, interrupt: &Interrupt) -> CasEnumeration<'_> {
        let (outer, pending_error) = match fs::read_dir(&self.cas_dir) {
            Ok(rd) => (Some(rd), None),
            Err(e) => (None, Some(DumbcasError::io(&self.cas_dir, e))),
        };
        CasEnumeration {
            cas: self,
            interrupt: interrupt.clone(),
            outer,
            inner: None,
            pending_error,
            done: false,
        }
    }

    /// Quarantine `rel_path` (relative to `cas/`) and raise the fsck flag.
    fn quarantine(&self, rel_path: &Path) {
        warn!("unexpected item in store: {}", rel_path.display());
        if let Err(err) = self.trash.put(rel_path) {
            warn!("failed to quarantine {}: {err}", rel_path.display());
        }
        self.set_fsck_bit();
    }

    fn fsck_path(&self) -> PathBuf {
        self.cas_dir.join(NEED_FSCK_NAME)
    }

    /// Mark the store as integrity-suspect. The flag survives restarts;
    /// only a successful full fsck clears it.
    pub fn set_fsck_bit(&self) {
        warn!("marking store for fsck");
        if let Err(err) = File::create(self.fsck_path()) {
            warn!("failed to set fsck flag: {err}");
        }
    }

    /// Whether the store is marked integrity-suspect.
    pub fn fsck_bit(&self) -> bool {
        self.fsck_path().exists()
    }

    /// Clear the integrity-suspect flag.
    pub fn clear_fsck_bit(&self) {
        debug!("clearing fsck flag");
        let _ = fs::remove_file(self.fsck_path());
    }
}

/// Lazy enumeration over the objects of a [`CasTable`].
pub struct CasEnumeration<'a> {
    cas: &'a CasTable,
    interrupt: Interrupt,
    outer: Option<ReadDir>,
    inner: Option<(String, ReadDir)>,
    pending_error: Option<DumbcasError>,
    done: bool,
}

impl CasEnumeration<'_> {
    fn suffix_length() -> usize {
        HASH_LENGTH - PREFIX_LENGTH
    }
}

impl Iterator for CasEnumeration<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(err) = self.pending_error.take() {
            self.done = true;
            self.cas.set_fsck_bit();
            return Some(Err(err));
        }
        loop {
            if self.interrupt.is_set() {
                self.done = true;
                return None;
            }
            // Drain the current bucket first.
            if let Some((prefix, entries)) = self.inner.as_mut() {
                match entries.next() {
                    Some(Ok(dirent)) => {
                        let name = dirent.file_name().to_string_lossy().into_owned();
                        if name.len() == Self::suffix_length() && hashing::is_lower_hex(&name) {
                            return Some(Ok(format!("{prefix}{name}")));
                        }
                        let rel = Path::new(prefix.as_str()).join(&name);
                        self.cas.quarantine(&rel);
                        continue;
                    }
                    Some(Err(e)) => {
                        let bucket = self.cas.cas_dir.join(prefix.as_str());
                        self.cas.set_fsck_bit();
                        return Some(Err(DumbcasError::io(bucket, e)));
                    }
                    None => {
                        self.inner = None;
                        continue;
                    }
                }
            }
            let outer = self.outer.as_mut()?;
            match outer.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    self.cas.set_fsck_bit();
                    return Some(Err(DumbcasError::io(&self.cas.cas_dir, e)));
                }
                Some(Ok(dirent)) => {
                    let name = dirent.file_name().to_string_lossy().into_owned();
                    if name == TRASH_NAME || name == NEED_FSCK_NAME {
                        continue;
                    }
                    if name.len() != PREFIX_LENGTH || !hashing::is_lower_hex(&name) {
                        self.cas.quarantine(Path::new(&name));
                        continue;
                    }
                    let bucket = self.cas.cas_dir.join(&name);
                    match fs::read_dir(&bucket) {
                        Ok(entries) => self.inner = Some((name, entries)),
                        Err(e) => {
                            self.cas.set_fsck_bit();
                            return Some(Err(DumbcasError::io(&bucket, e)));
                        }
                    }
                }
            }
        }
    }
}
