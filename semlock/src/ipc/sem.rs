//! Safe wrapper over System V semaphore arrays.
//!
//! This module is the only place that talks to `semget(2)`, `semop(2)` and
//! `semctl(2)`. It knows nothing about owners, slots, or removal guards; it
//! exposes a semaphore array as a [`SemSet`] with per-counter operations and
//! turns every `-1` return into a [`SemlockError::Kernel`] naming the call.
//!
//! ```text
//! Unsafe libc calls:              Safe wrappers:
//! ┌──────────────────────┐        ┌──────────────────────────┐
//! │ semget(IPC_EXCL)     │───────>│ SemSet::create_exclusive │
//! │ semget(key, 0, 0)    │───────>│ SemSet::open             │
//! │ semop()              │───────>│ SemSet::adjust           │
//! │ semctl(SETVAL)       │───────>│ SemSet::set_value        │
//! │ semctl(GETVAL)       │───────>│ SemSet::value            │
//! │ semctl(GETALL)       │───────>│ SemSet::values           │
//! │ semctl(IPC_STAT)     │───────>│ SemSet::stat             │
//! │ semctl(IPC_RMID)     │───────>│ SemSet::remove           │
//! └──────────────────────┘        └──────────────────────────┘
//! ```
//!
//! Every [`SemSet::adjust`] is issued with `SEM_UNDO`: the kernel records the
//! inverse of each operation per process and applies it when the process
//! exits, however it exits.

use std::mem::MaybeUninit;

use libc::{c_int, c_short, c_ushort};
use rustix::fs::Mode;
use rustix::io::Errno;

use crate::error::{Result, SemlockError};
use crate::ipc::key::IpcKey;

/// Largest value a semaphore counter (and a per-process undo adjustment) can hold.
pub const SEMVMX: i16 = i16::MAX;

/// Linux default for the number of counters in one array (`SEMMSL`).
pub const SEMMSL: usize = 32_000;

/// Reads `errno` after a failed libc call.
pub(crate) fn last_errno() -> Errno {
    Errno::from_raw_os_error(
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO),
    )
}

/// Whether a semaphore operation may sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Sleep until the operation can be applied.
    Block,
    /// Fail immediately with `EAGAIN` instead of sleeping (`IPC_NOWAIT`).
    NoWait,
}

/// Metadata reported by `semctl(IPC_STAT)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemStat {
    /// Time of the last successful `semop`, or 0 if none has happened yet.
    pub otime: i64,
    /// Time of the last `semctl` change (creation, `SETVAL`).
    pub ctime: i64,
    /// Number of counters in the array.
    pub nsems: usize,
}

impl SemStat {
    /// Whether at least one `semop` has ever completed on the array.
    #[must_use]
    pub const fn operated(&self) -> bool {
        self.otime != 0
    }
}

/// Handle to a kernel semaphore array.
///
/// Dropping a `SemSet` does nothing: the array lives in the kernel until
/// [`SemSet::remove`] is called by some process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemSet {
    id: c_int,
    key: IpcKey,
}

impl SemSet {
    /// Creates a new array of `nsems` counters, failing if one exists for `key`.
    ///
    /// Returns `Ok(None)` if an array already exists (`EEXIST`). New counters
    /// start at zero.
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] for any other `semget` failure
    /// (`EACCES`, `ENOSPC`, `EINVAL` for an `nsems` above the system limit, ...).
    pub fn create_exclusive(key: IpcKey, nsems: usize, mode: Mode) -> Result<Option<Self>> {
        let flags = mode.bits() as c_int | libc::IPC_CREAT | libc::IPC_EXCL;

        // SAFETY: semget takes no pointers.
        let id = unsafe { libc::semget(key.as_raw(), nsems as c_int, flags) };
        if id == -1 {
            return match last_errno() {
                Errno::EXIST => Ok(None),
                errno => Err(SemlockError::kernel("semget", key, errno)),
            };
        }

        Ok(Some(Self { id, key }))
    }

    /// Opens the existing array for `key`.
    ///
    /// Returns `Ok(None)` if no array exists (`ENOENT`).
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] for any other `semget` failure.
    pub fn open(key: IpcKey) -> Result<Option<Self>> {
        // SAFETY: semget takes no pointers.
        let id = unsafe { libc::semget(key.as_raw(), 0, 0) };
        if id == -1 {
            return match last_errno() {
                Errno::NOENT => Ok(None),
                errno => Err(SemlockError::kernel("semget", key, errno)),
            };
        }

        Ok(Some(Self { id, key }))
    }

    /// Kernel identifier of the array.
    #[must_use]
    pub const fn id(&self) -> c_int {
        self.id
    }

    #[must_use]
    pub const fn key(&self) -> IpcKey {
        self.key
    }

    /// Sets counter `num` to `value` (`SETVAL`).
    ///
    /// Clears every process's undo adjustment for that counter and does not
    /// count as an operation for [`SemStat::otime`].
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] if `semctl` fails.
    pub fn set_value(&self, num: u16, value: i16) -> Result<()> {
        // SAFETY: SETVAL reads the fourth argument as an int.
        let rc = unsafe {
            libc::semctl(self.id, c_int::from(num), libc::SETVAL, c_int::from(value))
        };
        if rc == -1 {
            return Err(SemlockError::kernel("semctl(SETVAL)", self.key, last_errno()));
        }
        Ok(())
    }

    /// Current value of counter `num` (`GETVAL`).
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] if `semctl` fails.
    pub fn value(&self, num: u16) -> Result<u16> {
        // SAFETY: GETVAL ignores the optional fourth argument.
        let rc = unsafe { libc::semctl(self.id, c_int::from(num), libc::GETVAL) };
        if rc == -1 {
            return Err(SemlockError::kernel("semctl(GETVAL)", self.key, last_errno()));
        }
        Ok(rc as u16)
    }

    /// Values of all counters, in index order (`GETALL`).
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] if either `semctl` call fails.
    pub fn values(&self) -> Result<Vec<u16>> {
        let nsems = self.stat()?.nsems;
        let mut values: Vec<c_ushort> = vec![0; nsems];

        // SAFETY: GETALL writes exactly `nsems` unsigned shorts, and `values`
        // has room for that many.
        let rc = unsafe { libc::semctl(self.id, 0, libc::GETALL, values.as_mut_ptr()) };
        if rc == -1 {
            return Err(SemlockError::kernel("semctl(GETALL)", self.key, last_errno()));
        }
        Ok(values)
    }

    /// Array metadata (`IPC_STAT`).
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] if `semctl` fails (e.g. `EIDRM` after
    /// the array was removed).
    pub fn stat(&self) -> Result<SemStat> {
        let mut ds = MaybeUninit::<libc::semid_ds>::zeroed();

        // SAFETY: IPC_STAT fills a `semid_ds` through the pointer, which is
        // valid and properly sized.
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_STAT, ds.as_mut_ptr()) };
        if rc == -1 {
            return Err(SemlockError::kernel("semctl(IPC_STAT)", self.key, last_errno()));
        }

        // SAFETY: zero-initialized and then filled by a successful IPC_STAT.
        let ds = unsafe { ds.assume_init() };
        Ok(SemStat {
            otime: ds.sem_otime as i64,
            ctime: ds.sem_ctime as i64,
            nsems: ds.sem_nsems as usize,
        })
    }

    /// Atomically adds `delta` to counter `num`, with `SEM_UNDO`.
    ///
    /// A negative `delta` needs the counter to be at least `-delta`. With
    /// [`Wait::Block`] the call sleeps until it is; with [`Wait::NoWait`] it
    /// returns `Ok(false)` instead.
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] for every failure other than the
    /// `EAGAIN` of a non-blocking call, including `EINTR` when a signal
    /// interrupts a blocked call and `EIDRM` when the array is removed
    /// underneath it.
    pub fn adjust(&self, num: u16, delta: i16, wait: Wait) -> Result<bool> {
        let mut flags = libc::SEM_UNDO;
        if wait == Wait::NoWait {
            flags |= libc::IPC_NOWAIT;
        }

        let mut op = libc::sembuf {
            sem_num: num,
            sem_op: delta,
            sem_flg: flags as c_short,
        };

        // SAFETY: `op` is a single valid sembuf and nsops is 1.
        let rc = unsafe { libc::semop(self.id, &mut op, 1) };
        if rc == -1 {
            return match last_errno() {
                Errno::AGAIN if wait == Wait::NoWait => Ok(false),
                errno => Err(SemlockError::kernel("semop", self.key, errno)),
            };
        }
        Ok(true)
    }

    /// Destroys the array (`IPC_RMID`), waking every blocked waiter with `EIDRM`.
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] if `semctl` fails.
    pub fn remove(&self) -> Result<()> {
        // SAFETY: IPC_RMID ignores the optional fourth argument.
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        if rc == -1 {
            return Err(SemlockError::kernel("semctl(IPC_RMID)", self.key, last_errno()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{private_set, skip_if_unsupported};

    #[test]
    fn fresh_array_starts_at_zero_without_operations() {
        let Some(set) = skip_if_unsupported("fresh_array", private_set(3)) else {
            return;
        };

        assert_eq!(set.values().unwrap(), vec![0, 0, 0]);
        let stat = set.stat().unwrap();
        assert_eq!(stat.nsems, 3);
        assert!(!stat.operated());

        set.remove().unwrap();
    }

    #[test]
    fn set_value_does_not_count_as_operation() {
        let Some(set) = skip_if_unsupported("set_value", private_set(2)) else {
            return;
        };

        set.set_value(0, SEMVMX).unwrap();
        set.set_value(1, 1).unwrap();
        assert_eq!(set.value(0).unwrap(), SEMVMX as u16);
        assert_eq!(set.value(1).unwrap(), 1);
        assert!(!set.stat().unwrap().operated());

        assert!(set.adjust(1, -1, Wait::Block).unwrap());
        assert!(set.stat().unwrap().operated());

        set.remove().unwrap();
    }

    #[test]
    fn nowait_decrement_reports_contention() {
        let Some(set) = skip_if_unsupported("nowait_decrement", private_set(1)) else {
            return;
        };

        set.set_value(0, 1).unwrap();
        assert!(set.adjust(0, -1, Wait::NoWait).unwrap());
        assert!(!set.adjust(0, -1, Wait::NoWait).unwrap());
        assert!(set.adjust(0, 1, Wait::NoWait).unwrap());
        assert_eq!(set.value(0).unwrap(), 1);

        set.remove().unwrap();
    }

    #[test]
    fn removed_array_reports_kernel_error() {
        let Some(set) = skip_if_unsupported("removed_array", private_set(1)) else {
            return;
        };

        set.remove().unwrap();
        let err = set.stat().unwrap_err();
        assert!(matches!(err, SemlockError::Kernel { op: "semctl(IPC_STAT)", .. }));
        assert!(matches!(set.remove(), Err(SemlockError::Kernel { .. })));
    }

    #[test]
    fn open_missing_key_returns_none() {
        // Keys are 32-bit; this one is vanishingly unlikely to be in use.
        let key = IpcKey::from_raw(0x5e31_0c4b);
        match SemSet::open(key) {
            Ok(found) => assert!(found.is_none()),
            Err(err) => eprintln!("Skipping open_missing_key_returns_none: {err}"),
        }
    }
}
