//! Page table entry flags for software emulation.

/// Page table entry flags for software emulation.
///
/// Flags are stored as a raw usize with specific bits representing the attributes a
/// descriptor carries: validity, table-vs-page, permissions and the access flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Present (valid) bit (bit 0).
    const PRESENT: usize = 1 << 0;

    /// Set on interior entries that point at a next-level table (bit 1).
    const TABLE: usize = 1 << 1;

    /// Writable bit (bit 2).
    const WRITABLE: usize = 1 << 2;

    /// User-accessible bit (bit 3).
    const USER: usize = 1 << 3;

    /// Access flag (bit 5).
    const ACCESSED: usize = 1 << 5;

    /// No-execute bit (bit 63).
    const NO_EXECUTE: usize = 1 << 63;

    /// Every bit that carries a flag.
    pub(super) const MASK: usize = Self::PRESENT
        | Self::TABLE
        | Self::WRITABLE
        | Self::USER
        | Self::ACCESSED
        | Self::NO_EXECUTE;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags for an interior entry pointing at a next-level table.
    ///
    /// Interior entries are permissive; the leaf decides the effective access.
    pub const fn table() -> Self {
        Self(Self::PRESENT | Self::TABLE | Self::WRITABLE | Self::USER | Self::ACCESSED)
    }

    /// The default profile for user data pages: present, writable, user, cached,
    /// accessed and not executable.
    pub const fn user_data() -> Self {
        Self(Self::PRESENT | Self::WRITABLE | Self::USER | Self::ACCESSED | Self::NO_EXECUTE)
    }

    /// Creates page flags from a raw usize value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw & Self::MASK)
    }

    /// Returns the raw usize value of these flags.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    fn set(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.set(Self::PRESENT, present);
    }

    /// Returns whether this describes a next-level table rather than a page.
    pub fn is_table(self) -> bool {
        (self.0 & Self::TABLE) != 0
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITABLE, writable);
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.set(Self::USER, user);
    }

    /// Returns whether instruction fetches are allowed.
    pub fn is_executable(self) -> bool {
        (self.0 & Self::NO_EXECUTE) == 0
    }

    /// Allows or forbids instruction fetches.
    pub fn set_executable(&mut self, executable: bool) {
        self.set(Self::NO_EXECUTE, !executable);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
