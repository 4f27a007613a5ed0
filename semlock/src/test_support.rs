//! Helpers shared by unit tests that need real kernel semaphore sets.

use std::sync::atomic::{AtomicI32, Ordering};

use rustix::fs::Mode;
use rustix::io::Errno;

use crate::error::{Result, SemlockError};
use crate::ipc::key::IpcKey;
use crate::ipc::sem::SemSet;

static NEXT_KEY: AtomicI32 = AtomicI32::new(0);

/// A key no other test in this run uses, with any leftover set purged.
pub(crate) fn fresh_key() -> IpcKey {
    let pid = std::process::id() as i32 & 0xfff;
    let n = NEXT_KEY.fetch_add(1, Ordering::Relaxed) & 0xfff;
    let key = IpcKey::from_raw(0x5e00_0000 | (pid << 12) | n);

    if let Ok(Some(set)) = SemSet::open(key) {
        let _ = set.remove();
    }
    key
}

/// A new unnamed array of `nsems` counters.
pub(crate) fn private_set(nsems: usize) -> Result<SemSet> {
    SemSet::create_exclusive(IpcKey::PRIVATE, nsems, Mode::RUSR | Mode::WUSR)
        .map(|set| set.expect("IPC_PRIVATE never collides"))
}

/// Unwraps `result`, or returns `None` when the host has no System V IPC
/// available to this process (sandboxes, restricted containers).
pub(crate) fn skip_if_unsupported<T>(name: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(
            err @ SemlockError::Kernel {
                source: Errno::NOSYS | Errno::ACCESS | Errno::PERM,
                ..
            },
        ) => {
            eprintln!("Skipping {name}: {err}");
            None
        }
        Err(err) => panic!("{name}: {err}"),
    }
}
