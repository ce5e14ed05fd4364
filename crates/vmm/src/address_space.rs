//! Address space management.
//!
//! An [`AddressSpace`] is everything the kernel knows about one process's user memory:
//! its page directory, its mapped regions, and the layout of the program image and stack
//! that the loader set up. The mapping operations and the fault resolver extend it in
//! their own modules.

use alloc::vec::Vec;

use crate::{
    PageDirectory, PageNumber, PhysicalAddress, Region, RegionTracker, VirtualAddress, VmError,
    VmResult, arch,
    file::write_full,
    frame_allocator::frame_bytes,
    page_directory::{CopyMode, DirectoryUsage},
};

/// Where the loader placed the program image and the initial stack.
///
/// Pages inside the image (`base..base + size`) and the stack are not tracked as regions;
/// the fault resolver fills them with zeroed user data pages on first touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramLayout {
    pub base: VirtualAddress,
    pub size: usize,
    /// First address above the stack.
    pub stack_top: VirtualAddress,
    pub stack_size: usize,
}

impl ProgramLayout {
    /// A layout with no image and no stack.
    pub const fn empty() -> Self {
        Self {
            base: VirtualAddress::new(0),
            size: 0,
            stack_top: VirtualAddress::new(0),
            stack_size: 0,
        }
    }

    /// First address past the program image.
    pub fn image_end(&self) -> VirtualAddress {
        self.base + self.size
    }

    /// Lowest address of the stack.
    pub fn stack_bottom(&self) -> VirtualAddress {
        self.stack_top - self.stack_size
    }

    /// True if `va` lies in the program image or the stack.
    pub fn contains(&self, va: VirtualAddress) -> bool {
        (self.base <= va && va < self.image_end())
            || (self.stack_bottom() <= va && va < self.stack_top)
    }
}

impl Default for ProgramLayout {
    fn default() -> Self {
        Self::empty()
    }
}

/// Number of faults resolved, by outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounters {
    /// Zeroed pages installed in the program image or stack.
    pub translation: usize,
    /// Region pages populated on first access.
    pub access: usize,
    /// Write faults resolved by copy-on-write.
    pub copy_on_write: usize,
}

pub(crate) struct AddressSpaceInner {
    pub(crate) directory: PageDirectory,
    pub(crate) regions: RegionTracker,
    pub(crate) layout: ProgramLayout,
    pub(crate) faults: FaultCounters,
}

impl AddressSpaceInner {
    /// Writes the present pages of `region` between `start` and `end` back to its file.
    ///
    /// Whole pages are written at the region's file offset, so the file may grow.
    pub(crate) fn write_back(
        &self,
        region: &Region,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> VmResult<()> {
        let Some(file) = region.file.as_deref() else {
            return Ok(());
        };
        for page in PageNumber::range(start, end).map(PageNumber::start) {
            if let Some(frame) = self.directory.entry(page).and_then(|entry| entry.address()) {
                // SAFETY: the directory holds a reference on the frame while the lock is held.
                let bytes = unsafe { frame_bytes(frame) };
                write_full(file, region.file_offset(page), bytes)?;
            }
        }
        log::trace!("wrote back {}..{}", start, end);
        Ok(())
    }

    /// Unmaps whichever pages in `[start, end)` are present.
    pub(crate) fn unmap_present(&mut self, start: VirtualAddress, end: VirtualAddress) {
        for page in PageNumber::range(start, end).map(PageNumber::start) {
            if self.directory.entry(page).is_some() {
                self.directory.unmap(page, 1);
            }
        }
    }
}

impl Drop for AddressSpaceInner {
    fn drop(&mut self) {
        for region in self.regions.iter().filter(|r| r.needs_write_back()) {
            if let Err(err) = self.write_back(region, region.start, region.end()) {
                log::warn!(
                    "lost write-back of {}..{} at teardown: {}",
                    region.start,
                    region.end(),
                    err
                );
            }
        }
    }
}

/// The user memory of one process.
///
/// All state sits behind one lock; operations take it for their whole duration.
pub struct AddressSpace {
    pub(crate) inner: spin::Mutex<AddressSpaceInner>,
}

impl AddressSpace {
    /// Creates an empty address space with a fresh root table.
    pub fn new() -> VmResult<Self> {
        Ok(Self::from_parts(
            PageDirectory::new()?,
            RegionTracker::new(),
            ProgramLayout::empty(),
        ))
    }

    fn from_parts(directory: PageDirectory, regions: RegionTracker, layout: ProgramLayout) -> Self {
        Self {
            inner: spin::Mutex::new(AddressSpaceInner {
                directory,
                regions,
                layout,
                faults: FaultCounters::default(),
            }),
        }
    }

    /// Duplicates this address space for a forked child.
    ///
    /// Regions are copied (taking new file references). Pages of shared regions are
    /// shared outright; all other pages are shared copy-on-write.
    pub fn fork(&self) -> VmResult<AddressSpace> {
        let mut inner = self.inner.lock();
        let regions = inner.regions.duplicate();
        let AddressSpaceInner {
            directory,
            regions: parent_regions,
            ..
        } = &mut *inner;
        let child = directory.copy(CopyMode::CopyOnWrite, |va| parent_regions.is_shared(va))?;
        // Writable parent pages just became read-only.
        arch::flush_all();
        log::debug!(
            "forked address space {} into {} ({} regions)",
            directory.root(),
            child.root(),
            regions.len()
        );
        Ok(Self::from_parts(child, regions, inner.layout))
    }

    /// Physical address of the root table, for installing on a processor.
    pub fn root(&self) -> PhysicalAddress {
        self.inner.lock().directory.root()
    }

    pub fn layout(&self) -> ProgramLayout {
        self.inner.lock().layout
    }

    /// Records where the loader placed the image and stack.
    pub fn set_layout(&self, layout: ProgramLayout) {
        self.inner.lock().layout = layout;
    }

    /// Moves the end of the program image, as `brk` does.
    ///
    /// Growing fails with [`VmError::OutOfMemory`] if the new extent would reach a region
    /// or the top of user space. Shrinking unmaps the pages no longer covered.
    pub fn set_program_size(&self, size: usize) -> VmResult<()> {
        let mut inner = self.inner.lock();
        let layout = inner.layout;
        let old_end = layout.image_end().align_up(arch::PAGE_SIZE);
        let new_end = layout
            .base
            .checked_add(size)
            .filter(|end| end.as_usize() <= arch::USER_SPACE_TOP)
            .ok_or(VmError::OutOfMemory)?
            .align_up(arch::PAGE_SIZE);

        if new_end > old_end && !inner.regions.is_usable(old_end, new_end - old_end) {
            return Err(VmError::OutOfMemory);
        }
        if new_end < old_end {
            inner.unmap_present(new_end, old_end);
        }
        inner.layout.size = size;
        log::debug!("program size {:#x} -> {:#x}", layout.size, size);
        Ok(())
    }

    /// Copies `len` bytes (or zeros, with no source) into this address space, allocating
    /// pages as needed. Used by the loader; the address space need not be active.
    pub fn copy_to_user(
        &self,
        va: VirtualAddress,
        source: Option<&[u8]>,
        len: usize,
    ) -> VmResult<()> {
        self.inner.lock().directory.copy_to_user(va, source, len)
    }

    /// Reads mapped memory without permission checks or faulting.
    pub fn read(&self, va: VirtualAddress, buf: &mut [u8]) -> VmResult<()> {
        self.inner.lock().directory.read(va, buf)
    }

    /// Physical address `va` currently translates to.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.inner.lock().directory.translate(va)
    }

    /// Returns a copy of the region containing `va`.
    pub fn region(&self, va: VirtualAddress) -> Option<Region> {
        self.inner.lock().regions.find_region(va).cloned()
    }

    /// Returns copies of every region, in address order.
    pub fn regions(&self) -> Vec<Region> {
        self.inner.lock().regions.iter().cloned().collect()
    }

    pub fn fault_counters(&self) -> FaultCounters {
        self.inner.lock().faults
    }

    /// Frames held by the page directory.
    pub fn usage(&self) -> DirectoryUsage {
        self.inner.lock().directory.usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameAllocator, MapFlags, Protection, testing, testing::MemFile};
    use alloc::sync::Arc;

    const PAGE: usize = arch::PAGE_SIZE;

    fn layout() -> ProgramLayout {
        ProgramLayout {
            base: VirtualAddress::new(0x40_0000),
            size: 3 * PAGE,
            stack_top: VirtualAddress::new(0x7000_0000),
            stack_size: 4 * PAGE,
        }
    }

    #[test]
    fn layout_covers_image_and_stack() {
        let layout = layout();
        assert!(layout.contains(VirtualAddress::new(0x40_0000)));
        assert!(layout.contains(VirtualAddress::new(0x40_0000 + 3 * PAGE - 1)));
        assert!(!layout.contains(VirtualAddress::new(0x40_0000 + 3 * PAGE)));
        assert!(layout.contains(VirtualAddress::new(0x7000_0000 - 4 * PAGE)));
        assert!(!layout.contains(VirtualAddress::new(0x7000_0000)));
        assert!(!ProgramLayout::empty().contains(VirtualAddress::new(0)));
    }

    #[test]
    fn drop_returns_every_frame() {
        testing::setup(64);
        let before = testing::free_frames();
        let space = AddressSpace::new().unwrap();
        space
            .mmap(
                0,
                3 * PAGE,
                Protection::READ | Protection::WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None,
                0,
            )
            .unwrap();
        space
            .copy_to_user(VirtualAddress::new(0x40_0000), Some(b"hello"), 5)
            .unwrap();
        drop(space);
        assert_eq!(testing::free_frames(), before);
    }

    #[test]
    fn drop_writes_back_shared_file_mappings() {
        testing::setup(64);
        let file = MemFile::shared(&[0u8; PAGE]);
        let space = AddressSpace::new().unwrap();
        let addr = space
            .mmap(
                0,
                PAGE,
                Protection::READ | Protection::WRITE,
                MapFlags::SHARED,
                Some(file.clone()),
                0,
            )
            .unwrap();
        space.inner.lock().directory.write(addr, b"persist").unwrap();
        drop(space);
        assert_eq!(&file.contents()[..7], b"persist");
        assert_eq!(Arc::strong_count(&file), 1);
    }

    #[test]
    fn fork_shares_private_pages_copy_on_write() {
        testing::setup(64);
        let allocator = FrameAllocator::current();
        let parent = AddressSpace::new().unwrap();
        let addr = parent
            .mmap(
                0,
                PAGE,
                Protection::READ | Protection::WRITE,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None,
                0,
            )
            .unwrap();
        let frame = parent.translate(addr).unwrap();

        let child = parent.fork().unwrap();
        assert_eq!(child.translate(addr), Some(frame));
        assert_eq!(allocator.ref_count(frame), 2);
        assert_eq!(child.regions().len(), 1);
        assert_ne!(child.root(), parent.root());

        drop(parent);
        assert_eq!(allocator.ref_count(frame), 1);
    }

    #[test]
    fn loader_writes_after_fork_stay_private() {
        testing::setup(64);
        let parent = AddressSpace::new().unwrap();
        parent.set_layout(layout());
        let sp = VirtualAddress::new(0x7000_0000 - 64);
        parent.copy_to_user(sp, Some(b"parent-stack-arg"), 16).unwrap();

        let child = parent.fork().unwrap();
        child.copy_to_user(sp, Some(b"CHILD-WROTE-THIS"), 16).unwrap();

        let mut buf = [0u8; 16];
        parent.read(sp, &mut buf).unwrap();
        assert_eq!(&buf, b"parent-stack-arg");
        child.read(sp, &mut buf).unwrap();
        assert_eq!(&buf, b"CHILD-WROTE-THIS");
    }

    #[test]
    fn fork_copies_layout() {
        testing::setup(64);
        let parent = AddressSpace::new().unwrap();
        parent.set_layout(layout());
        assert_eq!(parent.fork().unwrap().layout(), layout());
    }

    #[test]
    fn program_size_grows_and_shrinks() {
        testing::setup(64);
        let space = AddressSpace::new().unwrap();
        space.set_layout(layout());
        space
            .copy_to_user(VirtualAddress::new(0x40_0000), None, 3 * PAGE)
            .unwrap();

        space.set_program_size(5 * PAGE).unwrap();
        assert_eq!(space.layout().size, 5 * PAGE);

        space.set_program_size(PAGE).unwrap();
        assert_eq!(space.usage().pages, 1);
    }

    #[test]
    fn program_cannot_grow_into_a_region() {
        testing::setup(64);
        let space = AddressSpace::new().unwrap();
        space.set_layout(layout());
        space
            .mmap(
                0x40_0000 + 4 * PAGE,
                PAGE,
                Protection::READ,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED,
                None,
                0,
            )
            .unwrap();
        assert_eq!(space.set_program_size(6 * PAGE), Err(VmError::OutOfMemory));
        assert_eq!(space.set_program_size(4 * PAGE), Ok(()));
    }
}
