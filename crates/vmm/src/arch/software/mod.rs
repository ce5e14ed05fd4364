//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated architecture that can run on any host.
//! It's designed for testing and development without requiring actual hardware access.
//!
//! Unlike a scale model, the emulated architecture uses the real geometry of a 64-bit
//! four-level MMU:
//! - 48-bit canonical virtual addresses
//! - 4 levels of page tables (level 3 is the root, level 0 holds leaf entries)
//! - 9-bit indexes (512 entries per table)
//! - 12-bit page offset (4 KiB pages)
//!
//! Only physical memory is emulated: it lives in a page-aligned host buffer, and
//! "physical addresses" are offsets into that buffer.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::{PhysicalAddress, VirtualAddress};

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::{ENTRY_COUNT, PageTable};

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels (level 3 down to level 0).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Upper bound on emulated physical memory; sizes the flat frame table.
pub const MAX_PHYSICAL_MEMORY: usize = 256 * 1024 * 1024;

/// First address above the mappable user range. The last canonical lower-half page
/// is kept as a guard.
pub const USER_SPACE_TOP: usize = 0x0000_7FFF_FFFF_F000;

/// Where address search starts when a process has no mappings yet.
pub const MMAP_BASE: usize = 0x0000_0010_0000_0000;

/// Returns the page table index for a given virtual address at the specified level.
///
/// - Level 0: Bits 12-20 (leaf table)
/// - Level 1: Bits 21-29
/// - Level 2: Bits 30-38
/// - Level 3: Bits 39-47 (root)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(
        level < PAGE_TABLE_LEVELS,
        "level out of range for software emulation (0-3)"
    );
    (address >> (12 + level * 9)) & (ENTRY_COUNT - 1)
}

/// Validates a physical address for software emulation.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for software emulation.
///
/// Virtual addresses must be canonical (bits 47-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address by sign-extending bit 47 to bits 48-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Installs `root` as the translation root of the calling processor.
///
/// The emulated MMU walks whatever table it is handed, so there is no register to load.
///
/// # Safety
/// Mirrors the hardware contract: `root` must point at a valid top-level table.
pub unsafe fn activate(root: PhysicalAddress) {
    let _ = root;
}

/// Invalidates the local TLB entry for `page`. The emulated MMU has no TLB.
#[inline]
pub fn flush_page(page: VirtualAddress) {
    let _ = page;
}

/// Invalidates the entire local TLB. The emulated MMU has no TLB.
#[inline]
pub fn flush_all() {}

/// Emulated physical memory for software simulation.
///
/// This provides a simulated physical memory space for testing page table operations
/// without requiring actual hardware or virtual memory support from the host OS.
/// The buffer is page-aligned so that frames can be reinterpreted as page tables.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the buffer is owned exclusively by this value and only handed out as raw
// pointers; synchronisation of the contents is the job of the frame allocator and the
// page table owners, exactly as with real RAM.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new zero-filled emulated memory region of the specified size.
    ///
    /// # Panics
    /// Panics if `size` is zero or not a multiple of [`PAGE_SIZE`].
    pub fn new(size: usize) -> Self {
        assert!(
            size != 0 && size % PAGE_SIZE == 0,
            "emulated memory must be a non-zero multiple of the page size"
        );
        let layout = Self::layout(size);
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).unwrap_or_else(|| alloc::alloc::handle_alloc_error(layout));
        Self { base, size }
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, PAGE_SIZE).expect("emulated memory layout overflow")
    }

    /// Translates a physical address to a host pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: phys is within the allocation.
        unsafe { self.base.as_ptr().add(phys) }
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), Self::layout(self.size)) }
    }
}
