//! Address types for physical and virtual memory management.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, and the translator the kernel uses to reach physical memory.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Address translator for converting between physical and virtual addresses.
///
/// This enum supports two modes:
/// - Hardware: Uses a direct-map offset for translation (kernel mode)
/// - Emulated: Uses an emulated memory buffer for translation (testing mode)
///
/// Every page table walk and every frame copy goes through the translator, which
/// is what lets an inactive address space be edited from any context.
pub enum AddressTranslator {
    /// Hardware translation using a direct-map offset.
    Hardware { direct_map_offset: usize },
    /// Emulated translation using a simulated memory region.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a new hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates a new emulated translator backed by `size` bytes of physical memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the global address translator.
    ///
    /// This function must be called exactly once during initialization.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns a reference to the current global address translator.
    ///
    /// # Panics
    ///
    /// Panics if the translator has not been set yet.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current().expect(
            "address translator not set; call AddressTranslator::set_current during initialization",
        )
    }

    /// Returns a reference to the current global address translator if it has been set.
    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                t.get().map(|translator| {
                    // SAFETY: We leak the reference to make it 'static. This is safe because:
                    // 1. In test mode, each thread has its own ADDRESS_TRANSLATOR
                    // 2. Once set, it's never modified (spin::Once guarantees this)
                    // 3. The thread-local lives for the entire duration of the thread
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    /// Translates a physical address to a virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys.as_usize()) as *mut T
    }
}

/// Global address translator.
///
/// This is initialized once during kernel initialization (with Hardware variant).
/// In test/software-emulation mode, this is thread-local to allow each test to have its own
/// emulated memory space.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Returns true if the address sits on a page boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(arch::PAGE_SIZE)
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     physical address. It provides methods for address manipulation and alignment checks."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the corresponding frame number for this physical address.
    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     This is a newtype wrapper around the architecture-dependent representation of a\n\
     virtual address. It provides methods for address manipulation, alignment checks,\n\
     and extracting page table indices."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Creates a virtual address if `addr` is canonical.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if arch::validate_virtual(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Creates a virtual address from a physical address using the direct map offset.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been set via [`AddressTranslator::set_current`].
    #[inline]
    pub fn direct_mapped(phys: PhysicalAddress) -> Self {
        let translator = AddressTranslator::current();
        let virt = translator.phys_to_virt(phys.as_usize());

        // In emulated mode, phys_to_virt returns a host pointer which isn't canonical
        // for the guest architecture. Bypass the validity check in that case.
        #[cfg(any(test, feature = "software-emulation"))]
        if matches!(translator, AddressTranslator::Emulated(_)) {
            return Self(virt);
        }

        Self::new(virt)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Returns the page table index at the specified level.
    ///
    /// Page table levels are numbered from 0 (the lowest level, closest to the page)
    /// upward to the root at `PAGE_TABLE_LEVELS - 1`.
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Adds `len` bytes, returning None on overflow or if the result leaves the
    /// canonical range.
    #[inline]
    pub const fn checked_add(self, len: usize) -> Option<Self> {
        match self.0.checked_add(len) {
            Some(end) => Self::try_new(end),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_max_valid_address() {
            let max_addr = (1usize << arch::MAX_PHYSICAL_BITS) - 1;
            let addr = PhysicalAddress::new(max_addr);
            assert_eq!(addr.as_usize(), max_addr);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn alignment() {
            let addr = PhysicalAddress::new(0x5123);
            assert!(!addr.is_page_aligned());
            assert_eq!(addr.align_down(arch::PAGE_SIZE), PhysicalAddress::new(0x5000));
            assert_eq!(addr.align_up(arch::PAGE_SIZE), PhysicalAddress::new(0x6000));
        }

        #[test]
        fn frame_number() {
            let addr = PhysicalAddress::new(arch::PAGE_SIZE * 3 + 10);
            assert_eq!(addr.frame_number(), FrameNumber::new(3));
        }

        #[test]
        fn display_format() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!(format!("{}", addr), "0x1000");
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x1000)");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn new_valid_halves() {
            assert_eq!(VirtualAddress::new(0x7FFF_FFFF_F000).as_usize(), 0x7FFF_FFFF_F000);
            assert_eq!(
                VirtualAddress::new(0xFFFF_8000_0000_0000).as_usize(),
                0xFFFF_8000_0000_0000
            );
        }

        #[test]
        #[should_panic(expected = "address is not canonical")]
        fn new_non_canonical() {
            VirtualAddress::new(0x0000_8000_0000_0000);
        }

        #[test]
        fn checked_add_rejects_non_canonical_results() {
            let addr = VirtualAddress::new(0x7FFF_FFFF_F000);
            assert_eq!(addr.checked_add(0x1000), None);
            assert_eq!(
                addr.checked_add(0xFFF),
                Some(VirtualAddress::new(0x7FFF_FFFF_FFFF))
            );
        }

        #[test]
        fn page_indices() {
            let addr = VirtualAddress::new((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12) | 0x56);
            assert_eq!(addr.page_offset(), 0x56);
            assert_eq!(addr.page_index(0), 4);
            assert_eq!(addr.page_index(1), 3);
            assert_eq!(addr.page_index(2), 2);
            assert_eq!(addr.page_index(3), 1);
        }

        #[test]
        fn sub_address_operator() {
            let a = VirtualAddress::new(0x3000);
            let b = VirtualAddress::new(0x1000);
            assert_eq!(a - b, 0x2000);
        }
    }

    mod translation {
        use super::*;

        #[test]
        fn emulated_round_trip() {
            AddressTranslator::set_current(AddressTranslator::emulated(16 * arch::PAGE_SIZE));
            let phys = PhysicalAddress::new(3 * arch::PAGE_SIZE);
            let virt = VirtualAddress::direct_mapped(phys);
            let ptr = AddressTranslator::current().phys_to_ptr::<u8>(phys);
            assert_eq!(virt.as_ptr::<u8>(), ptr as *const u8);
        }

        #[test]
        #[should_panic(expected = "address translator already set")]
        fn panics_on_double_set() {
            AddressTranslator::set_current(AddressTranslator::hardware(0xFFFF_8000_0000_0000));
            AddressTranslator::set_current(AddressTranslator::hardware(0xFFFF_9000_0000_0000));
        }

        #[test]
        fn hardware_offset() {
            let translator = AddressTranslator::hardware(0xFFFF_8000_0000_0000);
            assert_eq!(translator.phys_to_virt(0x1000), 0xFFFF_8000_0000_1000);
        }
    }
}
