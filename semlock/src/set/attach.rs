//! Creating or attaching to a lock set.
//!
//! ```text
//! semget(IPC_EXCL) ──ok──> owner:  SETVAL guard=M, slots=1 ──┐
//!       │                                                    │
//!     EEXIST                                                 ├─> semop(guard, -1, SEM_UNDO)
//!       │                                                    │
//!       └─> semget(key) ──> member: poll IPC_STAT until ─────┘
//!               │                   sem_otime != 0
//!             ENOENT (set removed in between): start over
//! ```
//!
//! `SETVAL` does not touch `sem_otime`, so the first operation the kernel
//! ever records on a fresh array is the owner's own registration, which it
//! only issues after every counter is initialized. Members therefore never
//! observe half-initialized counters.

use std::path::Path;
use std::thread;
use std::time::Duration;

use rustix::fs::Mode;

use super::{GUARD, GUARD_CAPACITY, Role, Semlock, is_vanished};
use crate::config::SemlockConfig;
use crate::error::{Result, SemlockError};
use crate::ipc::key::IpcKey;
use crate::ipc::sem::{SemSet, Wait};
use crate::trace::{debug, info, trace, warn};

/// Outcome of one pass of the attach protocol.
enum Attempt {
    Attached(Semlock),
    /// The array was removed while we were attaching to it.
    Vanished,
}

impl Semlock {
    /// Creates or attaches to the lock set named by `path` and `project`.
    ///
    /// The first process to arrive creates the set with `mode` permissions
    /// and becomes its [`Role::Owner`]; everyone else waits until the owner
    /// has initialized it. Blocks until this handle's guard share is
    /// registered.
    ///
    /// # Errors
    ///
    /// - Key derivation errors, see [`IpcKey::resolve`]
    /// - [`SemlockError::InvalidSlotCount`] if `slots` is 0 or above the kernel limit
    /// - [`SemlockError::SlotCountMismatch`] if an existing set has fewer slots
    /// - [`SemlockError::Kernel`] if any kernel call fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use semlock::{Mode, Semlock};
    ///
    /// let mut lock = Semlock::create("/var/run/myapp", 1, 4, Mode::RUSR | Mode::WUSR)?;
    /// lock.lock(2)?;
    /// // ... critical section ...
    /// lock.unlock(2)?;
    /// lock.remove()?;
    /// # Ok::<(), semlock::SemlockError>(())
    /// ```
    pub fn create(path: impl AsRef<Path>, project: i32, slots: u16, mode: Mode) -> Result<Self> {
        let key = IpcKey::resolve(path, project)?;
        let config = SemlockConfig {
            slots,
            mode,
            ..SemlockConfig::default()
        };
        Self::attach(key, &config)
    }

    /// Creates or attaches to the lock set for an already-resolved `key`.
    ///
    /// Same protocol as [`Semlock::create`].
    ///
    /// # Errors
    ///
    /// See [`Semlock::create`].
    pub fn attach(key: IpcKey, config: &SemlockConfig) -> Result<Self> {
        let slots = config.validate()?;
        let nsems = usize::from(slots) + 1;

        loop {
            let attempt = match SemSet::create_exclusive(key, nsems, config.mode)? {
                Some(set) => attach_as_owner(set, slots)?,
                None => match SemSet::open(key)? {
                    Some(set) => attach_as_member(set, slots, config.init_poll_interval)?,
                    None => Attempt::Vanished,
                },
            };

            match attempt {
                Attempt::Attached(lock) => return Ok(lock),
                Attempt::Vanished => {
                    debug!(%key, "semaphore set removed during attach, retrying");
                }
            }
        }
    }
}

fn attach_as_owner(set: SemSet, slots: u16) -> Result<Attempt> {
    info!(key = %set.key(), semid = set.id(), slots, "created semaphore set");

    if let Err(err) = initialize(&set, slots) {
        warn!(key = %set.key(), error = %err, "initialization failed, removing set");
        // Waiting members see EIDRM and start over.
        let _ = set.remove();
        return Err(err);
    }

    register(set, slots, Role::Owner)
}

fn attach_as_member(set: SemSet, slots: u16, poll: Duration) -> Result<Attempt> {
    debug!(key = %set.key(), semid = set.id(), "attaching to existing semaphore set");

    match wait_initialized(&set, slots, poll) {
        Ok(()) => register(set, slots, Role::Member),
        Err(err) if is_vanished(&err) => Ok(Attempt::Vanished),
        Err(err) => Err(err),
    }
}

/// Sets the guard to its full capacity and every slot to free.
fn initialize(set: &SemSet, slots: u16) -> Result<()> {
    set.set_value(GUARD, GUARD_CAPACITY)?;
    for counter in 1..=slots {
        set.set_value(counter, 1)?;
    }
    Ok(())
}

/// Polls until the owner's first operation shows up in `sem_otime`.
///
/// No retry bound: an owner that dies between creation and registration
/// leaves members waiting here until someone purges the set.
fn wait_initialized(set: &SemSet, slots: u16, poll: Duration) -> Result<()> {
    let mut polls: u64 = 0;
    loop {
        let stat = set.stat()?;

        let expected = usize::from(slots) + 1;
        if stat.nsems < expected {
            return Err(SemlockError::SlotCountMismatch {
                key: set.key(),
                expected,
                actual: stat.nsems,
            });
        }

        if stat.operated() {
            if polls > 0 {
                debug!(key = %set.key(), polls, "owner finished initializing");
            }
            return Ok(());
        }

        trace!(key = %set.key(), polls, "waiting for owner to initialize");
        polls += 1;
        thread::sleep(poll);
    }
}

/// Takes this handle's share of the removal guard.
fn register(set: SemSet, slots: u16, role: Role) -> Result<Attempt> {
    match set.adjust(GUARD, -1, Wait::Block) {
        Ok(_) => {}
        Err(err) if is_vanished(&err) => return Ok(Attempt::Vanished),
        Err(err) => return Err(err),
    }

    info!(key = %set.key(), semid = set.id(), %role, "attached to semaphore set");
    Ok(Attempt::Attached(Semlock {
        set,
        slots,
        role,
        released: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fresh_key, skip_if_unsupported};
    use std::sync::{Arc, Barrier};

    #[test]
    fn first_attach_becomes_owner_and_initializes() {
        let key = fresh_key();
        let Some(mut lock) = skip_if_unsupported(
            "first_attach_becomes_owner",
            Semlock::attach(key, &SemlockConfig::with_slots(3)),
        ) else {
            return;
        };

        assert_eq!(lock.role(), Role::Owner);
        assert_eq!(lock.slots(), 3);
        assert_eq!(lock.key(), key);
        assert_eq!(
            lock.set.values().unwrap(),
            vec![GUARD_CAPACITY as u16 - 1, 1, 1, 1]
        );
        assert_eq!(lock.attached().unwrap(), 1);

        assert!(lock.remove().unwrap());
    }

    #[test]
    fn second_attach_is_member() {
        let key = fresh_key();
        let config = SemlockConfig::with_slots(2);
        let Some(mut owner) =
            skip_if_unsupported("second_attach_is_member", Semlock::attach(key, &config))
        else {
            return;
        };
        let mut member = Semlock::attach(key, &config).unwrap();

        assert!(owner.is_owner());
        assert_eq!(member.role(), Role::Member);
        assert_eq!(member.id(), owner.id());
        assert_eq!(owner.attached().unwrap(), 2);

        assert!(!owner.remove().unwrap());
        assert!(member.remove().unwrap());
    }

    #[test]
    fn member_may_ask_for_fewer_slots() {
        let key = fresh_key();
        let Some(mut owner) = skip_if_unsupported(
            "member_may_ask_for_fewer_slots",
            Semlock::attach(key, &SemlockConfig::with_slots(4)),
        ) else {
            return;
        };

        let mut member = Semlock::attach(key, &SemlockConfig::with_slots(2)).unwrap();
        assert_eq!(member.slots(), 2);

        assert!(!member.remove().unwrap());
        assert!(owner.remove().unwrap());
    }

    #[test]
    fn member_asking_for_more_slots_fails() {
        let key = fresh_key();
        let Some(mut owner) = skip_if_unsupported(
            "member_asking_for_more_slots_fails",
            Semlock::attach(key, &SemlockConfig::with_slots(1)),
        ) else {
            return;
        };

        let result = Semlock::attach(key, &SemlockConfig::with_slots(3));
        match result {
            Err(SemlockError::SlotCountMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 4);
                assert_eq!(actual, 2);
            }
            other => panic!("expected SlotCountMismatch, got {other:?}"),
        }

        // The failed attach never took a share.
        assert_eq!(owner.attached().unwrap(), 1);
        assert!(owner.remove().unwrap());
    }

    #[test]
    fn member_waits_for_owner_registration() {
        let key = fresh_key();
        let nsems = 2;

        // Stand in for an owner that has created the array but not yet
        // initialized or registered.
        let Some(Some(set)) = skip_if_unsupported(
            "member_waits_for_owner_registration",
            SemSet::create_exclusive(key, nsems, Mode::RUSR | Mode::WUSR),
        ) else {
            return;
        };

        let member = thread::spawn(move || {
            let config = SemlockConfig {
                slots: 1,
                init_poll_interval: Duration::from_millis(5),
                ..SemlockConfig::default()
            };
            Semlock::attach(key, &config)
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!member.is_finished(), "member must wait for the owner");

        initialize(&set, 1).unwrap();
        let Attempt::Attached(mut owner) = register(set, 1, Role::Owner).unwrap() else {
            panic!("set vanished");
        };

        let mut member = member.join().unwrap().unwrap();
        assert_eq!(member.role(), Role::Member);
        assert_eq!(owner.attached().unwrap(), 2);

        assert!(!member.remove().unwrap());
        assert!(owner.remove().unwrap());
    }

    #[test]
    fn racing_creators_elect_one_owner() {
        const RACERS: usize = 8;
        let key = fresh_key();

        if skip_if_unsupported("racing_creators_elect_one_owner", SemSet::open(key)).is_none() {
            return;
        }

        let barrier = Arc::new(Barrier::new(RACERS));
        let handles: Vec<_> = (0..RACERS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    Semlock::attach(key, &SemlockConfig::with_slots(2))
                })
            })
            .collect();

        let mut locks: Vec<Semlock> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        let owners = locks.iter().filter(|l| l.is_owner()).count();
        assert_eq!(owners, 1);
        assert!(locks.iter().all(|l| l.id() == locks[0].id()));
        assert_eq!(locks[0].attached().unwrap(), RACERS);

        let last = locks.pop().unwrap();
        for mut lock in locks {
            assert!(!lock.remove().unwrap());
        }
        let mut last = last;
        assert!(last.remove().unwrap());
    }

    #[test]
    fn invalid_slot_count_rejected_before_kernel() {
        let result = Semlock::attach(IpcKey::from_raw(1), &SemlockConfig::with_slots(0));
        assert!(matches!(result, Err(SemlockError::InvalidSlotCount { .. })));
    }
}
