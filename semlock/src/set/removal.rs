//! Releasing guard shares and destroying the set.
//!
//! The removal guard starts at `M` ([`GUARD_CAPACITY`]) and every attached
//! handle holds one unit. Removing a set means giving the unit back and then
//! trying to take all `M` units at once without waiting: that succeeds only
//! when no other handle, in any process, still holds a share. Shares of
//! crashed processes come back through `SEM_UNDO`, so they never block
//! removal forever.

use super::{GUARD, GUARD_CAPACITY, Semlock, is_vanished};
use crate::error::{Result, SemlockError};
use crate::ipc::key::IpcKey;
use crate::ipc::sem::{SemSet, Wait};
use crate::trace::{debug, info, warn};

impl Semlock {
    /// Gives back this handle's share and destroys the set if it was the last.
    ///
    /// Returns `true` if this call removed the set from the kernel, `false`
    /// if other handles are still attached (the set stays for them).
    /// After this call the handle must not be used for locking.
    ///
    /// # Errors
    ///
    /// - [`SemlockError::AlreadyRemoved`] if called more than once
    /// - [`SemlockError::Kernel`] if releasing the share or `IPC_RMID` fails
    pub fn remove(&mut self) -> Result<bool> {
        if self.released {
            return Err(SemlockError::AlreadyRemoved { key: self.key() });
        }

        self.release_share()?;

        // Another handle may win the reclamation and destroy the set between
        // our release and this call; that is the same outcome as losing.
        let reclaimed = match self.set.adjust(GUARD, -GUARD_CAPACITY, Wait::NoWait) {
            Ok(reclaimed) => reclaimed,
            Err(err) if is_vanished(&err) => false,
            Err(err) => return Err(err),
        };

        if !reclaimed {
            debug!(key = %self.key(), semid = self.id(), "semaphore set still in use");
            return Ok(false);
        }

        self.set.remove()?;
        info!(key = %self.key(), semid = self.id(), "removed semaphore set");
        Ok(true)
    }

    /// Gives back this handle's share without trying to destroy the set.
    ///
    /// Dropping the handle does the same, but swallows errors.
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] if `semop` fails.
    pub fn detach(mut self) -> Result<()> {
        self.release_share()
    }

    /// Raw value of the removal guard: [`GUARD_CAPACITY`] minus the shares held.
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] if `semctl` fails.
    pub fn guard_value(&self) -> Result<u16> {
        self.set.value(GUARD)
    }

    /// Number of handles currently holding a share of the guard.
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] if `semctl` fails.
    pub fn attached(&self) -> Result<usize> {
        let guard = self.guard_value()?;
        Ok(usize::from(GUARD_CAPACITY as u16 - guard))
    }

    /// Destroys the set for `key` regardless of who is attached.
    ///
    /// Meant for clearing sets orphaned by processes that all died without
    /// removing them. Attached handles in other processes get `EIDRM` from
    /// their next call. Returns `false` if no set exists for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SemlockError::Kernel`] if `semget` or `IPC_RMID` fails.
    pub fn purge(key: IpcKey) -> Result<bool> {
        let Some(set) = SemSet::open(key)? else {
            return Ok(false);
        };
        set.remove()?;
        warn!(%key, semid = set.id(), "purged semaphore set");
        Ok(true)
    }

    fn release_share(&mut self) -> Result<()> {
        self.set.adjust(GUARD, 1, Wait::Block)?;
        self.released = true;
        debug!(key = %self.key(), semid = self.id(), "released guard share");
        Ok(())
    }
}

impl Drop for Semlock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.release_share() {
            warn!(key = %self.key(), error = %err, "failed to release guard share on drop");
        }
    }
}
