//! Physical frame allocator with per-frame reference counts.
//!
//! Every frame below the physical memory ceiling has a [`Frame`] descriptor in one flat
//! table indexed by frame number. Free frames are threaded onto an intrusive list: the
//! first word of each free frame holds the physical address of the next one, written
//! through the direct map.
//!
//! Reference counts live in the descriptors and are updated atomically, so adjusting a
//! count never takes the free-list lock. Releasing a frame is a separate step from
//! dropping its last reference: callers decrement with [`FrameAllocator::dec_ref`] and
//! only hand the frame back with [`FrameAllocator::release`] once the count reaches zero.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::{
    AddressTranslator, Frame, FrameFlag, FrameNumber, PhysicalAddress, VmError, VmResult, arch,
};

/// Sentinel stored in the last free frame's link word.
const END_OF_LIST: usize = usize::MAX;

/// Snapshot of allocator occupancy, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Frames handed to the allocator (excluding the reserved region).
    pub total_frames: usize,
    /// Frames currently on the free list.
    pub free_frames: usize,
}

impl MemoryStats {
    /// Total managed memory in bytes.
    pub const fn total_bytes(&self) -> usize {
        self.total_frames * arch::PAGE_SIZE
    }

    /// Free memory in bytes.
    pub const fn free_bytes(&self) -> usize {
        self.free_frames * arch::PAGE_SIZE
    }

    /// Frames currently allocated.
    pub const fn used_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} KiB free of {} KiB",
            self.free_bytes() / 1024,
            self.total_bytes() / 1024
        )
    }
}

struct FreeList {
    head: usize,
    count: usize,
}

/// Allocates single physical frames and tracks how many mappings reference each one.
pub struct FrameAllocator {
    frames: Box<[Frame]>,
    reserved_end: PhysicalAddress,
    total_frames: usize,
    free: spin::Mutex<FreeList>,
}

impl FrameAllocator {
    /// Creates an allocator managing `[reserved_end, memory_end)`.
    ///
    /// Frames below `reserved_end` (and always frame zero) belong to the kernel image and
    /// boot structures; they are marked reserved and can never be released. Every other
    /// frame starts on the free list, lowest address first.
    ///
    /// # Panics
    ///
    /// Panics if either bound is unaligned, if `memory_end` exceeds the physical memory
    /// ceiling, or if the reserved region covers all of memory.
    pub fn new(reserved_end: PhysicalAddress, memory_end: PhysicalAddress) -> Self {
        assert!(
            reserved_end.is_page_aligned() && memory_end.is_page_aligned(),
            "frame allocator bounds must be page-aligned"
        );
        assert!(
            memory_end.as_usize() <= arch::MAX_PHYSICAL_MEMORY,
            "physical memory exceeds the frame table ceiling"
        );
        let reserved_end = core::cmp::max(reserved_end, PhysicalAddress::new(arch::PAGE_SIZE));
        assert!(reserved_end < memory_end, "no allocatable memory");

        let frame_count = memory_end.frame_number().as_usize();
        let mut frames = Vec::with_capacity(frame_count);
        frames.resize_with(frame_count, Frame::new);
        let frames = frames.into_boxed_slice();

        let reserved = reserved_end.frame_number();
        for frame in &frames[..reserved.as_usize()] {
            frame.flags.set(FrameFlag::Reserved);
        }

        let allocator = Self {
            frames,
            reserved_end,
            total_frames: frame_count - reserved.as_usize(),
            free: spin::Mutex::new(FreeList {
                head: END_OF_LIST,
                count: 0,
            }),
        };

        {
            let mut free = allocator.free.lock();
            for number in (reserved..FrameNumber::new(frame_count)).rev() {
                allocator.push(&mut free, number.start());
            }
        }

        log::debug!(
            "frame allocator: {} frames managed from {} to {}",
            allocator.total_frames,
            reserved_end,
            memory_end
        );
        allocator
    }

    /// Sets the global frame allocator.
    ///
    /// # Panics
    ///
    /// Panics if the allocator has already been set.
    pub fn set_current(allocator: FrameAllocator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if FRAME_ALLOCATOR.get().is_some() {
                panic!("frame allocator already set");
            }
            FRAME_ALLOCATOR.call_once(|| allocator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            FRAME_ALLOCATOR.with(|a| {
                if a.get().is_some() {
                    panic!("frame allocator already set");
                }
                a.call_once(|| allocator);
            });
        }
    }

    /// Returns the global frame allocator.
    ///
    /// # Panics
    ///
    /// Panics if no allocator has been set.
    pub fn current() -> &'static FrameAllocator {
        Self::try_current()
            .expect("frame allocator not set; call FrameAllocator::set_current during initialization")
    }

    /// Returns the global frame allocator if it has been set.
    pub fn try_current() -> Option<&'static FrameAllocator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            FRAME_ALLOCATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            FRAME_ALLOCATOR.with(|a| {
                a.get().map(|allocator| {
                    // SAFETY: each thread owns its allocator, which is never replaced once set
                    // and lives as long as the thread.
                    unsafe { &*(allocator as *const FrameAllocator) }
                })
            })
        }
    }

    /// Takes one frame off the free list and gives it a reference count of one.
    ///
    /// The frame's contents are unspecified.
    pub fn allocate(&self) -> VmResult<PhysicalAddress> {
        let addr = {
            let mut free = self.free.lock();
            if free.head == END_OF_LIST {
                log::warn!("frame allocator exhausted");
                return Err(VmError::OutOfMemory);
            }
            let addr = PhysicalAddress::new(free.head);
            // SAFETY: addr is a free frame inside managed memory; its first word holds the link.
            free.head = unsafe { *AddressTranslator::current().phys_to_ptr::<usize>(addr) };
            free.count -= 1;
            addr
        };

        let frame = self.descriptor(addr);
        assert!(
            !frame.flags.test_and_set(FrameFlag::Allocated),
            "free list handed out an allocated frame"
        );
        frame.reset_ref_count(1);

        #[cfg(feature = "detailed-logging")]
        log::trace!("allocate frame {}", addr);

        Ok(addr)
    }

    /// Allocates a frame and fills it with zeros.
    pub fn allocate_zeroed(&self) -> VmResult<PhysicalAddress> {
        let addr = self.allocate()?;
        zero_frame(addr);
        Ok(addr)
    }

    /// Returns a frame to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the frame is outside managed memory, unaligned, inside the reserved
    /// region, not allocated, or still referenced.
    pub fn release(&self, addr: PhysicalAddress) {
        assert!(addr.is_page_aligned(), "release of unaligned frame {}", addr);
        assert!(
            addr.frame_number().as_usize() < self.frames.len(),
            "release of frame {} outside managed memory",
            addr
        );
        assert!(addr >= self.reserved_end, "release of reserved frame {}", addr);

        let frame = self.descriptor(addr);
        assert_eq!(
            frame.ref_count(),
            0,
            "release of frame {} that is still referenced",
            addr
        );
        assert!(
            frame.flags.test(FrameFlag::Allocated),
            "double release of frame {}",
            addr
        );
        frame.flags.clear(FrameFlag::Allocated);

        #[cfg(feature = "detailed-logging")]
        log::trace!("release frame {}", addr);

        let mut free = self.free.lock();
        self.push(&mut free, addr);
    }

    /// Adds a reference to an allocated frame, returning the new count.
    pub fn inc_ref(&self, addr: PhysicalAddress) -> usize {
        self.allocated(addr).inc_ref()
    }

    /// Drops a reference to an allocated frame, returning the remaining count.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn dec_ref(&self, addr: PhysicalAddress) -> usize {
        self.allocated(addr).dec_ref()
    }

    /// Drops a reference and releases the frame if it was the last one.
    ///
    /// Returns true if the frame went back to the free list.
    pub fn put(&self, addr: PhysicalAddress) -> bool {
        if self.dec_ref(addr) == 0 {
            self.release(addr);
            true
        } else {
            false
        }
    }

    /// Returns the reference count of a frame.
    pub fn ref_count(&self, addr: PhysicalAddress) -> usize {
        self.descriptor(addr).ref_count()
    }

    /// Returns the descriptor for the frame containing `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside managed memory.
    pub fn frame(&self, addr: PhysicalAddress) -> &Frame {
        self.descriptor(addr)
    }

    /// Returns current occupancy.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_frames: self.total_frames,
            free_frames: self.free.lock().count,
        }
    }

    fn descriptor(&self, addr: PhysicalAddress) -> &Frame {
        self.frames
            .get(addr.frame_number().as_usize())
            .unwrap_or_else(|| panic!("frame {} outside managed memory", addr))
    }

    fn allocated(&self, addr: PhysicalAddress) -> &Frame {
        let frame = self.descriptor(addr);
        assert!(
            frame.flags.test(FrameFlag::Allocated),
            "reference count change on unallocated frame {}",
            addr
        );
        frame
    }

    fn push(&self, free: &mut FreeList, addr: PhysicalAddress) {
        // SAFETY: the frame is owned by the allocator from here on; nothing else maps it.
        unsafe { *AddressTranslator::current().phys_to_ptr::<usize>(addr) = free.head };
        free.head = addr.as_usize();
        free.count += 1;
    }
}

/// Returns the contents of a frame through the direct map.
///
/// # Safety
/// The caller must hold a reference on the frame for as long as the slice lives and must
/// not create another slice over the same frame.
pub(crate) unsafe fn frame_bytes<'a>(addr: PhysicalAddress) -> &'a mut [u8] {
    let ptr = AddressTranslator::current().phys_to_ptr::<u8>(addr);
    unsafe { core::slice::from_raw_parts_mut(ptr, arch::PAGE_SIZE) }
}

/// Fills a frame with zeros through the direct map.
pub(crate) fn zero_frame(addr: PhysicalAddress) {
    let ptr = AddressTranslator::current().phys_to_ptr::<u8>(addr);
    // SAFETY: the caller owns the frame and it is PAGE_SIZE bytes long.
    unsafe { core::ptr::write_bytes(ptr, 0, arch::PAGE_SIZE) };
}

/// Copies one frame's contents into another.
pub(crate) fn copy_frame(dst: PhysicalAddress, src: PhysicalAddress) {
    let translator = AddressTranslator::current();
    let src = translator.phys_to_ptr::<u8>(src);
    let dst = translator.phys_to_ptr::<u8>(dst);
    // SAFETY: distinct frames, each PAGE_SIZE bytes long.
    unsafe { core::ptr::copy_nonoverlapping(src, dst, arch::PAGE_SIZE) };
}

/// Global frame allocator.
///
/// In test/software-emulation mode, this is thread-local so that every test owns its own
/// emulated physical memory.
#[cfg(not(any(test, feature = "software-emulation")))]
static FRAME_ALLOCATOR: spin::Once<FrameAllocator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static FRAME_ALLOCATOR: spin::Once<FrameAllocator> = spin::Once::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn frame_zero_is_always_reserved() {
        AddressTranslator::set_current(AddressTranslator::emulated(8 * arch::PAGE_SIZE));
        let allocator = FrameAllocator::new(
            PhysicalAddress::new(0),
            PhysicalAddress::new(8 * arch::PAGE_SIZE),
        );
        assert_eq!(allocator.stats().total_frames, 7);
        assert!(allocator.frame(PhysicalAddress::new(0)).flags.test(FrameFlag::Reserved));
        let first = allocator.allocate().unwrap();
        assert_eq!(first, PhysicalAddress::new(arch::PAGE_SIZE));
    }

    #[test]
    fn allocates_in_ascending_order_with_count_one() {
        testing::setup(16);
        let allocator = FrameAllocator::current();
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert!(b > a);
        assert_eq!(allocator.ref_count(a), 1);
        assert_eq!(allocator.ref_count(b), 1);
    }

    #[test]
    fn exhaustion_returns_out_of_memory() {
        testing::setup(4);
        let allocator = FrameAllocator::current();
        let free = allocator.stats().free_frames;
        let frames: Vec<_> = (0..free).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(allocator.allocate(), Err(VmError::OutOfMemory));
        for frame in frames {
            assert!(allocator.put(frame));
        }
        assert_eq!(allocator.stats().free_frames, free);
    }

    #[test]
    fn released_frame_is_reused() {
        testing::setup(16);
        let allocator = FrameAllocator::current();
        let frame = allocator.allocate().unwrap();
        assert_eq!(allocator.dec_ref(frame), 0);
        allocator.release(frame);
        assert_eq!(allocator.allocate().unwrap(), frame);
    }

    #[test]
    fn shared_frame_survives_until_last_reference() {
        testing::setup(16);
        let allocator = FrameAllocator::current();
        let before = allocator.stats().free_frames;
        let frame = allocator.allocate().unwrap();
        assert_eq!(allocator.inc_ref(frame), 2);
        assert!(!allocator.put(frame));
        assert_eq!(allocator.stats().free_frames, before - 1);
        assert!(allocator.put(frame));
        assert_eq!(allocator.stats().free_frames, before);
    }

    #[test]
    fn allocate_zeroed_clears_stale_contents() {
        testing::setup(16);
        let allocator = FrameAllocator::current();
        let frame = allocator.allocate().unwrap();
        let ptr = AddressTranslator::current().phys_to_ptr::<u8>(frame);
        unsafe { core::ptr::write_bytes(ptr, 0xAB, arch::PAGE_SIZE) };
        allocator.put(frame);

        let frame = allocator.allocate_zeroed().unwrap();
        let ptr = AddressTranslator::current().phys_to_ptr::<u8>(frame);
        let bytes = unsafe { core::slice::from_raw_parts(ptr, arch::PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn stats_report_bytes() {
        testing::setup(16);
        let stats = FrameAllocator::current().stats();
        assert_eq!(stats.total_bytes(), stats.total_frames * arch::PAGE_SIZE);
        assert_eq!(stats.used_frames(), 0);
    }

    #[test]
    #[should_panic(expected = "still referenced")]
    fn release_of_referenced_frame_panics() {
        testing::setup(16);
        let allocator = FrameAllocator::current();
        let frame = allocator.allocate().unwrap();
        allocator.release(frame);
    }

    #[test]
    #[should_panic(expected = "release of reserved frame")]
    fn release_of_reserved_frame_panics() {
        testing::setup(16);
        FrameAllocator::current().release(PhysicalAddress::new(0));
    }

    #[test]
    #[should_panic(expected = "release of unaligned frame")]
    fn release_of_unaligned_frame_panics() {
        testing::setup(16);
        FrameAllocator::current().release(PhysicalAddress::new(arch::PAGE_SIZE * 4 + 8));
    }

    #[test]
    #[should_panic(expected = "outside managed memory")]
    fn release_outside_memory_panics() {
        testing::setup(16);
        FrameAllocator::current().release(PhysicalAddress::new(arch::PAGE_SIZE * 64));
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_panics() {
        testing::setup(16);
        let allocator = FrameAllocator::current();
        let frame = allocator.allocate().unwrap();
        allocator.put(frame);
        allocator.release(frame);
    }
}
