//! Error types for the dumbcas library
//!
//! All fallible operations return [`Result<T>`]. The error kinds mirror the
//! failure classes the store actually distinguishes: bad caller input,
//! missing objects, duplicate adds, corruption, filesystem trouble (always
//! wrapped with the offending path) and cancellation.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the dumbcas library
pub type Result<T> = std::result::Result<T, DumbcasError>;

/// Main error type for all dumbcas operations
#[derive(Debug, Error)]
pub enum DumbcasError {
    /// Malformed hash, relative root, empty label and friends
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A requested hash or node is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// An object or node with this name is already present
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Bytes do not match their name, or a stored blob refuses to decode
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// Filesystem error, with the path that triggered it
    #[error("{}: {source}", path.display())]
    Io {
        /// Path the operation was touching
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("bincode error: {0}")]
    Bincode(String),

    /// The process-wide interrupt latch was observed
    #[error("interrupted")]
    Interrupted,
}

// Implement conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for DumbcasError {
    fn from(err: bincode::error::DecodeError) -> Self {
        DumbcasError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for DumbcasError {
    fn from(err: bincode::error::EncodeError) -> Self {
        DumbcasError::Bincode(err.to_string())
    }
}

impl DumbcasError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DumbcasError::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid-argument error with a custom message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        DumbcasError::InvalidArgument(msg.into())
    }

    /// Create a corruption error with a custom message
    pub fn corrupted(msg: impl Into<String>) -> Self {
        DumbcasError::Corrupted(msg.into())
    }

    /// Check if this error indicates corruption of stored data
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            DumbcasError::Corrupted(_) | DumbcasError::Json(_) | DumbcasError::Bincode(_)
        )
    }
}
