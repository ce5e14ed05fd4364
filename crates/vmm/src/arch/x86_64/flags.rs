//! Page table entry flags for x86_64 architecture.

use x86_64::structures::paging::PageTableFlags;

/// Page table entry flags for x86_64.
///
/// This wraps the x86_64 crate's page table entry flags, exposing the same
/// attribute vocabulary as the emulated backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl From<usize> for PageFlags {
    fn from(value: usize) -> Self {
        Self(PageTableFlags::from_bits_truncate(value as u64))
    }
}

impl PageFlags {
    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Flags for an interior entry pointing at a next-level table.
    pub const fn table() -> Self {
        Self(
            PageTableFlags::PRESENT
                .union(PageTableFlags::WRITABLE)
                .union(PageTableFlags::USER_ACCESSIBLE)
                .union(PageTableFlags::ACCESSED),
        )
    }

    /// The default profile for user data pages: present, writable, user, cached,
    /// accessed and not executable.
    pub const fn user_data() -> Self {
        Self(
            PageTableFlags::PRESENT
                .union(PageTableFlags::WRITABLE)
                .union(PageTableFlags::USER_ACCESSIBLE)
                .union(PageTableFlags::ACCESSED)
                .union(PageTableFlags::NO_EXECUTE),
        )
    }

    /// Returns the raw usize value of these flags.
    pub const fn as_usize(self) -> usize {
        self.0.bits() as usize
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.0.set(PageTableFlags::PRESENT, present);
    }

    /// x86_64 has no table tag: interior entries are recognised by their level.
    pub fn is_table(self) -> bool {
        false
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    /// Returns whether instruction fetches are allowed.
    pub fn is_executable(self) -> bool {
        !self.0.contains(PageTableFlags::NO_EXECUTE)
    }

    /// Allows or forbids instruction fetches.
    pub fn set_executable(&mut self, executable: bool) {
        self.0.set(PageTableFlags::NO_EXECUTE, !executable);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
