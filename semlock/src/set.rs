//! Named cross-process lock sets.
//!
//! A [`Semlock`] is one process's attachment to a kernel semaphore array of
//! `slots + 1` counters:
//!
//! ```text
//! counter:   0               1        2              slots
//!          ┌───────────────┬────────┬────────┬─────┬────────┐
//!          │ removal guard │ slot 0 │ slot 1 │ ... │ slot N │
//!          │  M - attached │  0 / 1 │  0 / 1 │     │  0 / 1 │
//!          └───────────────┴────────┴────────┴─────┴────────┘
//! ```
//!
//! - [`attach`] - Owner election, initialization barrier, share registration
//! - [`slot`] - Lock, try-lock and unlock of individual slots
//! - [`removal`] - Releasing the share and destroying the array
//!
//! Every counter operation is issued with `SEM_UNDO`, so a process that dies
//! holding slots or a guard share has them returned by the kernel.

use std::fmt;

use rustix::io::Errno;

use crate::error::SemlockError;
use crate::ipc::key::IpcKey;
use crate::ipc::sem::{SEMVMX, SemSet};

mod attach;
mod removal;
mod slot;

pub use slot::SlotGuard;

/// Initial value of the removal guard.
///
/// Each attached handle holds one unit of it, so this is a hard cap on
/// concurrent attachments. It is also the largest adjustment the kernel's
/// undo bookkeeping accepts, which the exclusive reclamation in
/// [`Semlock::remove`] depends on.
pub const GUARD_CAPACITY: i16 = SEMVMX;

/// Counter index of the removal guard.
const GUARD: u16 = 0;

/// Whether `err` means the array was removed underneath the caller.
fn is_vanished(err: &SemlockError) -> bool {
    matches!(err.errno(), Some(Errno::IDRM | Errno::INVAL))
}

/// How this handle came to be attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the array and initialized its counters.
    Owner,
    /// Found the array already present and waited for the owner.
    Member,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Owner => f.write_str("owner"),
            Role::Member => f.write_str("member"),
        }
    }
}

/// A process-local handle on a named semaphore lock set.
///
/// Holds one share of the set's removal guard from construction until
/// [`remove`](Semlock::remove), [`detach`](Semlock::detach), or drop.
/// Lock operations take `&self`; a handle can be shared between threads, and
/// two handles on the same set in one process contend like two processes.
#[derive(Debug)]
pub struct Semlock {
    set: SemSet,
    slots: u16,
    role: Role,
    /// Set once this handle's guard share has been given back.
    released: bool,
}

impl Semlock {
    #[must_use]
    pub const fn key(&self) -> IpcKey {
        self.set.key()
    }

    /// Kernel identifier of the semaphore array.
    #[must_use]
    pub const fn id(&self) -> i32 {
        self.set.id()
    }

    /// Number of lock slots.
    #[must_use]
    pub const fn slots(&self) -> u16 {
        self.slots
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }

    /// Whether [`remove`](Semlock::remove) has been called on this handle.
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        self.released
    }
}
