//! System V IPC primitives.
//!
//! - [`key`] - Deriving a shared [`IpcKey`](key::IpcKey) from a path and project tag
//! - [`sem`] - Semaphore arrays and atomic counter operations

pub mod key;
pub mod sem;
