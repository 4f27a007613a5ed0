//! Named cross-process slot locks on System V semaphore sets.
//!
//! Unrelated processes that agree on a filesystem path and a project tag
//! attach to the same [`Semlock`], lock and unlock any of its numbered slots,
//! and destroy the shared set once the last of them is done with it. The
//! kernel undoes the locks and attachments of processes that die, so a crash
//! never leaves a slot held or the set undeletable.
//!
//! ```no_run
//! use semlock::{Semlock, SemlockConfig, IpcKey};
//!
//! let key = IpcKey::resolve("/var/run/myapp", 1)?;
//! let mut lock = Semlock::attach(key, &SemlockConfig::with_slots(4))?;
//!
//! if let Some(_slot) = lock.try_guard(0)? {
//!     // slot 0 held until `_slot` drops
//! }
//!
//! if lock.remove()? {
//!     println!("last one out, set destroyed");
//! }
//! # Ok::<(), semlock::SemlockError>(())
//! ```

pub mod config;
pub mod error;
pub mod ipc;
mod set;
mod trace;

#[cfg(test)]
mod test_support;

pub use config::SemlockConfig;
pub use error::{Result, SemlockError};
pub use ipc::key::IpcKey;
pub use set::{GUARD_CAPACITY, Role, Semlock, SlotGuard};
pub use trace::init_tracing;

// Permission bits for `SemlockConfig::mode`.
pub use rustix::fs::Mode;
