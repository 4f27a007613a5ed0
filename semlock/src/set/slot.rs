//! Per-slot lock, try-lock and unlock.
//!
//! Slot `n` is counter `n + 1`; counter 0 belongs to the removal guard and is
//! never reachable through these calls. A slot counter is 1 when free and 0
//! when held. Nothing here takes an in-process lock: two threads (or two
//! handles) hitting the same slot are serialized by the kernel alone.

use super::Semlock;
use crate::error::{Result, SemlockError};
use crate::ipc::sem::Wait;
use crate::trace::{trace, warn};

impl Semlock {
    /// Maps a caller slot index to its counter index.
    fn counter(&self, slot: i32) -> Result<u16> {
        if slot < 0 || slot >= i32::from(self.slots) {
            return Err(SemlockError::SlotOutOfRange {
                slot,
                slots: self.slots,
            });
        }
        Ok(slot as u16 + 1)
    }

    /// Acquires `slot`, sleeping until it is free.
    ///
    /// If this process exits without calling [`unlock`](Semlock::unlock),
    /// the kernel frees the slot.
    ///
    /// # Errors
    ///
    /// - [`SemlockError::SlotOutOfRange`] if `slot` is negative or `>= slots()`
    /// - [`SemlockError::Kernel`] if the wait is interrupted by a signal
    ///   (`EINTR`), the set is removed (`EIDRM`), or `semop` fails otherwise
    pub fn lock(&self, slot: i32) -> Result<()> {
        let counter = self.counter(slot)?;
        self.set.adjust(counter, -1, Wait::Block)?;
        trace!(key = %self.key(), slot, "locked");
        Ok(())
    }

    /// Acquires `slot` if it is free right now.
    ///
    /// Returns `Ok(false)` without waiting if another holder has it.
    ///
    /// # Errors
    ///
    /// Same as [`lock`](Semlock::lock), except contention is not an error.
    pub fn try_lock(&self, slot: i32) -> Result<bool> {
        let counter = self.counter(slot)?;
        let acquired = self.set.adjust(counter, -1, Wait::NoWait)?;
        trace!(key = %self.key(), slot, acquired, "try_lock");
        Ok(acquired)
    }

    /// Releases `slot`.
    ///
    /// Unlocking a slot this process did not lock still frees it for others,
    /// but leaves this process's undo bookkeeping unbalanced: when it exits,
    /// the kernel takes the slot back.
    ///
    /// # Errors
    ///
    /// - [`SemlockError::SlotOutOfRange`] if `slot` is negative or `>= slots()`
    /// - [`SemlockError::Kernel`] if `semop` fails (e.g. `ERANGE` when the
    ///   slot would exceed the kernel's maximum value)
    pub fn unlock(&self, slot: i32) -> Result<()> {
        let counter = self.counter(slot)?;
        self.set.adjust(counter, 1, Wait::Block)?;
        trace!(key = %self.key(), slot, "unlocked");
        Ok(())
    }

    /// Acquires `slot` and returns a guard that releases it on drop.
    ///
    /// # Errors
    ///
    /// See [`lock`](Semlock::lock).
    pub fn guard(&self, slot: i32) -> Result<SlotGuard<'_>> {
        self.lock(slot)?;
        Ok(SlotGuard { lock: self, slot })
    }

    /// Like [`guard`](Semlock::guard) but returns `Ok(None)` if the slot is held.
    ///
    /// # Errors
    ///
    /// See [`try_lock`](Semlock::try_lock).
    pub fn try_guard(&self, slot: i32) -> Result<Option<SlotGuard<'_>>> {
        if self.try_lock(slot)? {
            Ok(Some(SlotGuard { lock: self, slot }))
        } else {
            Ok(None)
        }
    }

    /// Current counter value of `slot`: 1 if free, 0 if held.
    ///
    /// The value can change as soon as it is read.
    ///
    /// # Errors
    ///
    /// [`SemlockError::SlotOutOfRange`] or [`SemlockError::Kernel`].
    pub fn slot_value(&self, slot: i32) -> Result<u16> {
        let counter = self.counter(slot)?;
        self.set.value(counter)
    }
}

/// A held slot, released when dropped.
#[must_use = "the slot is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SlotGuard<'a> {
    lock: &'a Semlock,
    slot: i32,
}

impl SlotGuard<'_> {
    #[must_use]
    pub fn slot(&self) -> i32 {
        self.slot
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock(self.slot) {
            warn!(key = %self.lock.key(), slot = self.slot, error = %err, "failed to release slot");
        }
    }
}
