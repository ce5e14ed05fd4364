//! Errors returned by the virtual memory manager.

use core::fmt;

/// Errors that can occur while manipulating an address space.
///
/// Contract violations (releasing a frame that is still referenced, unmapping a page
/// that was never mapped, ...) are not represented here; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free frame was available, or the requested range does not fit below the
    /// top of user space.
    OutOfMemory,
    /// Misaligned address, zero length, conflicting flags or a length mismatch.
    InvalidArgument,
    /// A leaf entry was already valid where a fresh mapping was requested.
    AlreadyMapped,
    /// A page walk without allocation hit a missing table.
    NotMapped,
    /// The backing file failed to read or write; carries the file's errno.
    BackingStore(isize),
    /// The page fault cannot be resolved and the faulting process must be terminated.
    Unrecoverable,
}

/// Result alias used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;

const ENOMEM: isize = 12;
const EINVAL: isize = 22;
const EEXIST: isize = 17;
const EFAULT: isize = 14;

impl VmError {
    /// Returns the negative errno the system-call layer reports for this error.
    pub const fn errno(self) -> isize {
        match self {
            Self::OutOfMemory => -ENOMEM,
            Self::InvalidArgument => -EINVAL,
            Self::AlreadyMapped => -EEXIST,
            Self::NotMapped | Self::Unrecoverable => -EFAULT,
            Self::BackingStore(errno) => {
                if errno < 0 {
                    errno
                } else {
                    -errno
                }
            }
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::AlreadyMapped => write!(f, "address already mapped"),
            Self::NotMapped => write!(f, "address not mapped"),
            Self::BackingStore(errno) => write!(f, "backing store error ({})", errno),
            Self::Unrecoverable => write!(f, "unrecoverable page fault"),
        }
    }
}

impl core::error::Error for VmError {}
