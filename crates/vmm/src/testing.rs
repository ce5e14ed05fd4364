//! Helpers shared by the unit tests.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::{AddressTranslator, BackingFile, FrameAllocator, PhysicalAddress, arch};

/// Installs emulated physical memory of `frames` frames and a frame allocator over it
/// for the calling test thread. Frame zero stays reserved.
pub fn setup(frames: usize) {
    let size = frames * arch::PAGE_SIZE;
    AddressTranslator::set_current(AddressTranslator::emulated(size));
    FrameAllocator::set_current(FrameAllocator::new(
        PhysicalAddress::new(arch::PAGE_SIZE),
        PhysicalAddress::new(size),
    ));
}

/// Number of frames currently on the free list.
pub fn free_frames() -> usize {
    FrameAllocator::current().stats().free_frames
}

/// An in-memory file.
pub struct MemFile {
    data: spin::Mutex<Vec<u8>>,
    error: Option<isize>,
}

impl MemFile {
    pub fn new(contents: &[u8]) -> Self {
        Self {
            data: spin::Mutex::new(contents.to_vec()),
            error: None,
        }
    }

    /// A one-page file whose every read and write fails with `errno`.
    pub fn failing(errno: isize) -> Self {
        Self {
            data: spin::Mutex::new(alloc::vec![0; arch::PAGE_SIZE]),
            error: Some(errno),
        }
    }

    pub fn shared(contents: &[u8]) -> Arc<Self> {
        Arc::new(Self::new(contents))
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, isize> {
        if let Some(errno) = self.error {
            return Err(errno);
        }
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        Ok(len)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, isize> {
        if let Some(errno) = self.error {
            return Err(errno);
        }
        let mut data = self.data.lock();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }
}
