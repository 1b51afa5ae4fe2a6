//! SHA-1 streaming helpers and hash-name validation
//!
//! Every object in the store is named by the lowercase hex SHA-1 of its
//! bytes. Hashing of file content is chunked so multi-gigabyte files never
//! sit in memory and so an interrupt is honored at chunk granularity.

use crate::error::{DumbcasError, Result};
use crate::interrupt::Interrupt;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Length of a lowercase hex SHA-1, in characters.
pub const HASH_LENGTH: usize = 40;

/// Read buffer for streaming hashes.
const CHUNK_SIZE: usize = 64 * 1024;

/// Whether `s` is entirely lowercase hex.
pub(crate) fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Whether `name` is a well-formed object name (anchored, exactly 40
/// lowercase hex characters).
pub fn is_valid_hash(name: &str) -> bool {
    name.len() == HASH_LENGTH && is_lower_hex(name)
}

/// SHA-1 of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Stream `reader` through SHA-1. `path` is only used for error context.
///
/// The interrupt token is polled between chunks; the current chunk always
/// completes.
pub fn hash_reader<R: Read>(reader: &mut R, path: &Path, interrupt: &Interrupt) -> Result<String> {
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        interrupt.check()?;
        let read = reader
            .read(&mut buffer)
            .map_err(|e| DumbcasError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 of a file's content.
pub fn hash_file(path: &Path, interrupt: &Interrupt) -> Result<String> {
    let mut file = File::open(path).map_err(|e| DumbcasError::io(path, e))?;
    hash_reader(&mut file, path, interrupt)
}
