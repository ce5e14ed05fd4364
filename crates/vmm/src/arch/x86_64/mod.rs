//! x86_64 architecture-specific implementation.
//!
//! This module provides the hardware implementation for x86_64 architecture,
//! including address validation, page table configuration, translation-root
//! switching and local TLB maintenance.

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress};

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::{ENTRY_COUNT, PageTable};

/// Maximum number of bits in a physical address on x86_64.
/// This is typically 52 bits on modern CPUs, but we use 48 as a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address on x86_64 with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Default page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels in x86_64 (4-level paging).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Physical memory ceiling covered by the flat frame table (64 GiB).
pub const MAX_PHYSICAL_MEMORY: usize = 64 * 1024 * 1024 * 1024;

/// First address above the mappable user range. The last canonical lower-half page
/// is kept as a guard.
pub const USER_SPACE_TOP: usize = 0x0000_7FFF_FFFF_F000;

/// Where address search starts when a process has no mappings yet.
pub const MMAP_BASE: usize = 0x0000_0010_0000_0000;

/// Returns the page table index for a given virtual address at the specified level.
///
/// For x86_64, each level uses 9 bits, with level 0 being the page table (PT),
/// level 1 being the page directory (PD), level 2 being the page directory pointer
/// table (PDPT), and level 3 being the page map level 4 (PML4).
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(
        level < PAGE_TABLE_LEVELS,
        "level out of range for x86_64 page table levels"
    );
    (address >> (12 + level * 9)) & (ENTRY_COUNT - 1)
}

/// Validates a physical address for x86_64.
///
/// Physical addresses must not exceed the maximum physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for x86_64.
///
/// Virtual addresses must be canonical (bits 47-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address for x86_64.
///
/// This sign-extends bit 47 to bits 48-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

/// Loads `root` into CR3, making it the translation root of the calling processor.
///
/// # Safety
/// This function is unsafe because loading an invalid page table can cause
/// undefined behavior, including memory corruption and system crashes.
/// The caller must ensure:
/// - The page table correctly maps all memory that will be accessed
/// - The kernel is properly mapped
/// - The page table itself is mapped
pub unsafe fn activate(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    // SAFETY: Caller must ensure the page table is valid
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

/// Invalidates the local TLB entry for `page`.
#[inline]
pub fn flush_page(page: VirtualAddress) {
    tlb::flush(VirtAddr::new(page.as_usize() as u64));
}

/// Invalidates the entire local TLB.
#[inline]
pub fn flush_all() {
    tlb::flush_all();
}
