//! Architecture-specific implementations for virtual memory management.
//!
//! This module conditionally imports either hardware-specific implementations
//! or software emulation based on the target architecture and features.

// Use x86_64 hardware implementation when we're on x86_64 and not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(all(target_arch = "x86_64"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Number of bits of a virtual address consumed by the page offset.
pub const PAGE_SHIFT: usize = PAGE_SIZE.trailing_zeros() as usize;

/// Rounds `len` up to a whole number of pages.
#[inline]
pub const fn page_round_up(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Returns the number of pages needed to hold `len` bytes.
#[inline]
pub const fn pages_for(len: usize) -> usize {
    page_round_up(len) >> PAGE_SHIFT
}
