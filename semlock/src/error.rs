//! Error types for semaphore set operations.

use rustix::io::Errno;
use thiserror::Error;

use crate::ipc::key::IpcKey;

/// Result alias for semlock operations.
pub type Result<T> = std::result::Result<T, SemlockError>;

/// Errors produced while attaching to, locking, or removing a semaphore set.
///
/// Contention is never an error: a non-blocking call that would block
/// reports `Ok(false)` instead.
#[derive(Debug, Error)]
pub enum SemlockError {
    /// The path cannot be turned into an IPC key.
    #[error("invalid key path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// `ftok` only uses the low 8 bits of the project tag, which must not be zero.
    #[error("invalid project tag {0}: low 8 bits must be non-zero")]
    InvalidProject(i32),

    #[error("slot count must be between 1 and {max}, got {slots}")]
    InvalidSlotCount { slots: usize, max: usize },

    /// Caller passed a slot index outside `0..slots`.
    #[error("slot {slot} out of range: set has {slots} slots")]
    SlotOutOfRange { slot: i32, slots: u16 },

    /// The existing set was created with fewer counters than requested.
    #[error("semaphore set {key} has {actual} counters, need at least {expected}")]
    SlotCountMismatch {
        key: IpcKey,
        expected: usize,
        actual: usize,
    },

    /// A kernel call failed for a reason other than contention.
    #[error("{op} failed for semaphore set {key}: {source}")]
    Kernel {
        op: &'static str,
        key: IpcKey,
        #[source]
        source: Errno,
    },

    /// `remove` was called a second time on the same handle.
    #[error("cannot remove semaphore set {key} more than once")]
    AlreadyRemoved { key: IpcKey },
}

impl SemlockError {
    pub(crate) fn kernel(op: &'static str, key: IpcKey, source: Errno) -> Self {
        Self::Kernel { op, key, source }
    }

    /// The kernel errno behind this error, if it came from a kernel call.
    #[must_use]
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Kernel { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// Whether this is a caller error detected before touching the kernel.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath { .. }
                | Self::InvalidProject(_)
                | Self::InvalidSlotCount { .. }
                | Self::SlotOutOfRange { .. }
        )
    }
}
