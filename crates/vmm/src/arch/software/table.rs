//! Page table structure for software emulation.

use super::entry::PageEntry;

/// Number of entries in a software-emulated page table.
pub const ENTRY_COUNT: usize = 512;

/// One node of the emulated four-level radix tree.
///
/// Tables are never built on the stack or the heap: they are views over zeroed
/// physical frames, which is why the type is page-sized and page-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
    }
}

const _: () = assert!(core::mem::size_of::<PageTable>() == super::PAGE_SIZE);
