//! System V IPC key derivation.
//!
//! Processes find the same semaphore set by agreeing on a filesystem path and
//! a small project tag. [`IpcKey::resolve`] turns that pair into the numeric
//! key the kernel indexes sets by, using `ftok(3)`: the key mixes the path's
//! inode and device numbers with the low 8 bits of the tag, so the path must
//! exist and must not be replaced while the set is in use.

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{Result, SemlockError};
use crate::ipc::sem::last_errno;

/// Numeric key of a System V IPC object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcKey(libc::key_t);

impl IpcKey {
    /// Key that always creates a new, unnamed set (`IPC_PRIVATE`).
    pub const PRIVATE: Self = Self(libc::IPC_PRIVATE);

    /// Wraps a key obtained elsewhere (e.g. agreed on out of band).
    #[must_use]
    pub const fn from_raw(key: libc::key_t) -> Self {
        Self(key)
    }

    #[must_use]
    pub const fn as_raw(self) -> libc::key_t {
        self.0
    }

    /// Derives the key for `path` and `project`.
    ///
    /// # Errors
    ///
    /// - [`SemlockError::InvalidPath`] if `path` is empty or contains a NUL byte
    /// - [`SemlockError::InvalidProject`] if the low 8 bits of `project` are zero
    /// - [`SemlockError::Kernel`] if `ftok` fails (typically `ENOENT`)
    pub fn resolve(path: impl AsRef<Path>, project: i32) -> Result<Self> {
        let path = path.as_ref();
        let c_path = validate_key_path(path)?;

        if project & 0xff == 0 {
            return Err(SemlockError::InvalidProject(project));
        }

        // SAFETY: `c_path` is a valid NUL-terminated string for the duration
        // of the call; ftok only reads it.
        let key = unsafe { libc::ftok(c_path.as_ptr(), project) };
        if key == -1 {
            return Err(SemlockError::kernel("ftok", IpcKey(-1), last_errno()));
        }

        Ok(Self(key))
    }
}

impl fmt::Display for IpcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0 as u32)
    }
}

fn validate_key_path(path: &Path) -> Result<CString> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Err(SemlockError::InvalidPath {
            path: String::new(),
            reason: "path must not be empty",
        });
    }

    CString::new(bytes).map_err(|_| SemlockError::InvalidPath {
        path: path.display().to_string(),
        reason: "path must not contain NUL bytes",
    })
}
