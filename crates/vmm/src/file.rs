//! Interface to the files that back memory mappings.
//!
//! The filesystem lives outside this crate. A mapping only needs positional reads and
//! writes and the current length; duplicating a handle is cloning the [`FileHandle`] and
//! closing it is dropping the clone.

use alloc::sync::Arc;

use crate::{VmError, VmResult};

/// A file that can back a memory mapping.
pub trait BackingFile: Send + Sync {
    /// Reads into `buf` starting at byte `offset`, returning the number of bytes read.
    ///
    /// Returns zero at end of file. Errors carry the filesystem's errno.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize>;

    /// Writes `buf` at byte `offset`, growing the file if needed. Returns the number of
    /// bytes written.
    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize>;

    /// Returns the current length of the file in bytes.
    fn len(&self) -> usize;

    /// Returns true if the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owned reference to a backing file.
pub type FileHandle = Arc<dyn BackingFile>;

/// Fills `buf` from `offset`, stopping early only at end of file.
///
/// Returns the number of bytes read; the rest of `buf` is left untouched.
pub(crate) fn read_full(file: &dyn BackingFile, offset: usize, buf: &mut [u8]) -> VmResult<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(offset + done, &mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(errno) => return Err(VmError::BackingStore(errno)),
        }
    }
    Ok(done)
}

/// Writes all of `buf` at `offset`.
pub(crate) fn write_full(file: &dyn BackingFile, offset: usize, buf: &[u8]) -> VmResult<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.write_at(offset + done, &buf[done..]) {
            Ok(0) => return Err(VmError::BackingStore(-5)),
            Ok(n) => done += n,
            Err(errno) => return Err(VmError::BackingStore(errno)),
        }
    }
    Ok(())
}
