use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Holds metadata for a physical memory frame.
///
/// One descriptor exists for every frame below the physical memory ceiling. The
/// reference count is the number of leaf entries, across every page directory, that
/// currently point at the frame (page table frames themselves hold one reference for
/// their owning directory).
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    ref_count: AtomicUsize,
}

impl Frame {
    /// Creates a descriptor for a frame that is not yet managed.
    pub const fn new() -> Self {
        Self {
            flags: FrameFlags::new(),
            ref_count: AtomicUsize::new(0),
        }
    }

    /// Returns the current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Sets the reference count, used when the frame leaves the free list.
    pub(crate) fn reset_ref_count(&self, count: usize) {
        self.ref_count.store(count, Ordering::Release);
    }

    /// Increments the reference count, returning the new value.
    pub(crate) fn inc_ref(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the reference count, returning the new value.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub(crate) fn dec_ref(&self) -> usize {
        match self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            }) {
            Ok(previous) => previous - 1,
            Err(_) => panic!("frame reference count underflow"),
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
pub enum FrameFlag {
    /// Frame is handed out by the allocator.
    Allocated = 1 << 0,
    /// Frame is reserved and should not be allocated.
    Reserved = 1 << 1,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Sets the given flag.
    pub fn set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u64, Ordering::AcqRel);
    }

    /// Clears the given flag.
    pub fn clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u64), Ordering::AcqRel);
    }

    /// Tests if the given flag is set.
    pub fn test(&self, flag: FrameFlag) -> bool {
        self.0.load(Ordering::Acquire) & flag as u64 != 0
    }

    /// Tests the given flag and sets it, returning the previous value.
    pub fn test_and_set(&self, flag: FrameFlag) -> bool {
        let mask = flag as u64;
        self.0.fetch_or(mask, Ordering::AcqRel) & mask != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_and_clear() {
        let flags = FrameFlags::new();
        assert!(!flags.test(FrameFlag::Allocated));
        flags.set(FrameFlag::Allocated);
        flags.set(FrameFlag::Reserved);
        flags.clear(FrameFlag::Allocated);
        assert!(!flags.test(FrameFlag::Allocated));
        assert!(flags.test(FrameFlag::Reserved));
    }

    #[test]
    fn test_and_set_reports_previous_state() {
        let flags = FrameFlags::new();
        assert!(!flags.test_and_set(FrameFlag::Allocated));
        assert!(flags.test_and_set(FrameFlag::Allocated));
    }

    #[test]
    fn reference_counting() {
        let frame = Frame::new();
        frame.reset_ref_count(1);
        assert_eq!(frame.inc_ref(), 2);
        assert_eq!(frame.dec_ref(), 1);
        assert_eq!(frame.dec_ref(), 0);
        assert_eq!(frame.ref_count(), 0);
    }

    #[test]
    #[should_panic(expected = "frame reference count underflow")]
    fn dec_ref_below_zero_panics() {
        Frame::new().dec_ref();
    }
}
