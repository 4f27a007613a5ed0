//! Tuning for attaching to a semaphore set.

use std::time::Duration;

use rustix::fs::Mode;

use crate::error::{Result, SemlockError};
use crate::ipc::sem::SEMMSL;

/// How to create or attach to a semaphore set.
///
/// The set itself is named by an [`IpcKey`](crate::IpcKey); this struct only
/// carries what the attaching process has to agree on with the others
/// (`slots`) and local behavior.
#[derive(Debug, Clone)]
pub struct SemlockConfig {
    /// Number of lock slots. The kernel array holds one more counter, the
    /// removal guard. Every process attaching to the same key must pass the
    /// same value or a smaller one.
    pub slots: u16,
    /// Permission bits for a newly created array. Ignored when attaching.
    pub mode: Mode,
    /// Sleep between polls while a late arrival waits for the owner to
    /// finish initializing the counters.
    pub init_poll_interval: Duration,
}

impl Default for SemlockConfig {
    fn default() -> Self {
        Self {
            slots: 1,
            mode: Mode::RUSR | Mode::WUSR,
            init_poll_interval: Duration::from_millis(10),
        }
    }
}

impl SemlockConfig {
    /// Config for `slots` lock slots with default mode and poll interval.
    #[must_use]
    pub fn with_slots(slots: u16) -> Self {
        Self {
            slots,
            ..Self::default()
        }
    }

    /// Checks `slots` against the kernel's per-array counter limit.
    pub(crate) fn validate(&self) -> Result<u16> {
        let max = SEMMSL - 1;
        if self.slots == 0 || usize::from(self.slots) > max {
            return Err(SemlockError::InvalidSlotCount {
                slots: usize::from(self.slots),
                max,
            });
        }
        Ok(self.slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_one_private_slot() {
        let config = SemlockConfig::default();
        assert_eq!(config.slots, 1);
        assert_eq!(config.mode.bits(), 0o600);
        assert_eq!(config.init_poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn zero_slots_rejected() {
        let result = SemlockConfig::with_slots(0).validate();
        assert!(matches!(
            result,
            Err(SemlockError::InvalidSlotCount { slots: 0, .. })
        ));
    }

    #[test]
    fn slot_count_above_kernel_limit_rejected() {
        let result = SemlockConfig::with_slots(u16::MAX).validate();
        assert!(matches!(
            result,
            Err(SemlockError::InvalidSlotCount { max, .. }) if max == SEMMSL - 1
        ));
        assert_eq!(SemlockConfig::with_slots(31_999).validate().unwrap(), 31_999);
    }
}
