//! Page table structure for x86_64 architecture.

use super::entry::PageEntry;

/// Number of entries in an x86_64 page table.
pub const ENTRY_COUNT: usize = 512;

/// A page table for x86_64 architecture.
///
/// This represents a single level in the page table hierarchy. On x86_64 with
/// 4-level paging, there are four levels: PML4 (level 3), PDPT (level 2),
/// PD (level 1), and PT (level 0). Tables are views over physical frames reached
/// through the direct map.
#[repr(transparent)]
pub struct PageTable {
    /// The underlying page table from the x86_64 crate.
    inner: x86_64::structures::paging::PageTable,
}

impl PageTable {
    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: PageEntry is a transparent u64 with the hardware layout.
        unsafe { *(&self.inner[index] as *const _ as *const PageEntry) }
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: We're reinterpreting the page table entry as our PageEntry type.
        // Both are 64-bit values with the same layout.
        unsafe { &mut *(&mut self.inner[index] as *mut _ as *mut PageEntry) }
    }
}
