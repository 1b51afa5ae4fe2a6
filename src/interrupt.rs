//! Cooperative cancellation token
//!
//! The binary owns the signal handling; the library only consumes a cheap
//! cloneable latch. Every long-running loop (enumeration, hashing, the
//! pipeline stages) polls the token between units of work, so an in-flight
//! read chunk finishes before the operation winds down.

use crate::error::{DumbcasError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide cancellation latch, set once and never cleared.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    /// Create a fresh, unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the token. Idempotent.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the token has been latched.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`DumbcasError::Interrupted`] when the token is latched.
    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(DumbcasError::Interrupted)
        } else {
            Ok(())
        }
    }
}
