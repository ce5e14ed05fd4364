//! Emulated user-mode memory accesses.
//!
//! With the software MMU there is no hardware to raise page faults, so user accesses are
//! performed here: each page is checked the way the MMU would check it, and a failing
//! check is turned into a [`PageFault`] and sent through the regular fault resolver
//! before the access is retried.

use crate::{
    AccessType, AddressSpace, FaultKind, PageFault, PhysicalAddress, VirtualAddress, VmError,
    VmResult, arch,
};

/// Faults taken on one page before the access is declared stuck.
const MAX_RETRIES: usize = 3;

impl AddressSpace {
    /// Checks one page for `access`, returning the physical address of `va`.
    fn probe(&self, va: VirtualAddress, access: AccessType) -> Result<PhysicalAddress, FaultKind> {
        let inner = self.inner.lock();
        let entry = inner
            .directory
            .entry(va.align_down(arch::PAGE_SIZE))
            .ok_or(FaultKind::Translation)?;
        let flags = entry.flags();
        let allowed = flags.is_user()
            && match access {
                AccessType::Read => true,
                AccessType::Write => flags.is_writable(),
                AccessType::Execute => flags.is_executable(),
            };
        if !allowed {
            return Err(FaultKind::Permission);
        }
        entry
            .address()
            .map(|frame| frame + va.page_offset())
            .ok_or(FaultKind::Translation)
    }

    /// Runs `op` on each page-sized chunk of `[va, va + len)`, faulting pages in first.
    fn access(
        &self,
        va: VirtualAddress,
        len: usize,
        access: AccessType,
        mut op: impl FnMut(PhysicalAddress, usize, usize),
    ) -> VmResult<()> {
        let mut done = 0;
        while done < len {
            let at = va.checked_add(done).ok_or(VmError::Unrecoverable)?;
            let chunk = (arch::PAGE_SIZE - at.page_offset()).min(len - done);
            let mut retries = 0;
            let phys = loop {
                match self.probe(at, access) {
                    Ok(phys) => break phys,
                    Err(_) if retries == MAX_RETRIES => return Err(VmError::Unrecoverable),
                    Err(kind) => {
                        self.handle_fault(PageFault::new(at, kind, access))?;
                        retries += 1;
                    }
                }
            };
            op(phys, done, chunk);
            done += chunk;
        }
        Ok(())
    }

    /// Reads user memory as the process would, resolving faults on the way.
    pub fn user_read(&self, va: VirtualAddress, buf: &mut [u8]) -> VmResult<()> {
        let len = buf.len();
        self.access(va, len, AccessType::Read, |phys, done, chunk| {
            let src = VirtualAddress::direct_mapped(phys).as_ptr::<u8>();
            // SAFETY: the chunk lies within one mapped frame.
            unsafe { core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk) };
        })
    }

    /// Writes user memory as the process would, resolving faults on the way.
    pub fn user_write(&self, va: VirtualAddress, data: &[u8]) -> VmResult<()> {
        self.access(va, data.len(), AccessType::Write, |phys, done, chunk| {
            let dst = VirtualAddress::direct_mapped(phys).as_mut_ptr::<u8>();
            // SAFETY: the chunk lies within one mapped frame.
            unsafe { core::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst, chunk) };
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FileHandle, FrameAllocator, MapFlags, ProgramLayout, Protection, RemapFlags, SyncFlags,
        file::BackingFile, testing, testing::MemFile,
    };
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;

    const PAGE: usize = arch::PAGE_SIZE;
    const RW: Protection = Protection::READ.union(Protection::WRITE);
    const ANON: MapFlags = MapFlags::PRIVATE.union(MapFlags::ANONYMOUS);

    fn read(space: &AddressSpace, va: VirtualAddress, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        space.user_read(va, &mut buf).unwrap();
        buf
    }

    #[test]
    fn anonymous_pages_round_trip_through_the_mmu() {
        testing::setup(64);
        let space = AddressSpace::new().unwrap();
        let before = testing::free_frames();
        let addr = space.mmap(0, 3 * PAGE, RW, ANON, None, 0).unwrap();

        let data: Vec<u8> = (0..3 * PAGE).map(|i| (i * 7) as u8).collect();
        space.user_write(addr, &data).unwrap();
        assert_eq!(read(&space, addr, 3 * PAGE), data);
        assert_eq!(space.fault_counters(), Default::default());

        space.munmap(addr.as_usize(), 3 * PAGE).unwrap();
        // Only the interior tables remain allocated.
        assert_eq!(before - testing::free_frames(), space.usage().tables - 1);
        assert_eq!(space.user_read(addr, &mut [0u8; 1]), Err(VmError::Unrecoverable));
    }

    #[test]
    fn private_file_page_matches_file() {
        testing::setup(64);
        let space = AddressSpace::new().unwrap();
        let contents: Vec<u8> = (0..PAGE).map(|i| (i % 13) as u8).collect();
        let file = MemFile::shared(&contents);
        let addr = space
            .mmap(0, PAGE, Protection::READ, MapFlags::PRIVATE, Some(file), 0)
            .unwrap();
        assert_eq!(read(&space, addr, PAGE), contents);
        assert_eq!(space.user_write(addr, b"x"), Err(VmError::Unrecoverable));
    }

    #[test]
    fn fork_isolates_child_writes() {
        testing::setup(64);
        let parent = AddressSpace::new().unwrap();
        let addr = parent.mmap(0, PAGE, RW, ANON, None, 0).unwrap();
        let child = parent.fork().unwrap();

        child.user_write(addr, &[0xFF; PAGE]).unwrap();
        assert!(read(&parent, addr, PAGE).iter().all(|&b| b == 0));
        assert!(read(&child, addr, PAGE).iter().all(|&b| b == 0xFF));
        assert_eq!(child.fault_counters().copy_on_write, 1);
        assert_eq!(parent.fault_counters().copy_on_write, 0);

        // A second write from the child needs no further copy.
        child.user_write(addr + 1, &[0xAA]).unwrap();
        assert_eq!(child.fault_counters().copy_on_write, 1);
    }

    #[test]
    fn fork_isolates_parent_writes() {
        testing::setup(64);
        let parent = AddressSpace::new().unwrap();
        let addr = parent.mmap(0, PAGE, RW, ANON, None, 0).unwrap();
        parent.user_write(addr, b"before").unwrap();
        let child = parent.fork().unwrap();

        parent.user_write(addr, b"after!").unwrap();
        assert_eq!(read(&child, addr, 6), b"before");
        assert_eq!(read(&parent, addr, 6), b"after!");
    }

    #[test]
    fn shared_anonymous_mapping_stays_shared_across_fork() {
        testing::setup(64);
        let parent = AddressSpace::new().unwrap();
        let addr = parent
            .mmap(0, PAGE, RW, MapFlags::SHARED | MapFlags::ANONYMOUS, None, 0)
            .unwrap();
        let child = parent.fork().unwrap();

        child.user_write(addr, b"hello parent").unwrap();
        assert_eq!(read(&parent, addr, 12), b"hello parent");
        let frame = parent.translate(addr).unwrap();
        assert_eq!(FrameAllocator::current().ref_count(frame), 2);
    }

    #[test]
    fn shared_file_write_and_sync() {
        testing::setup(64);
        let space = AddressSpace::new().unwrap();
        let file = MemFile::shared(&[0u8; PAGE]);
        let handle: FileHandle = file.clone();
        let addr = space
            .mmap(0x5000_0000, PAGE, RW, MapFlags::SHARED | MapFlags::FIXED, Some(handle), 0)
            .unwrap();

        let data: Vec<u8> = (0..PAGE).map(|i| (i % 200) as u8).collect();
        space.user_write(addr, &data).unwrap();
        space.msync(addr.as_usize(), PAGE, SyncFlags::SYNC).unwrap();

        let mut back = vec![0u8; PAGE];
        assert_eq!(file.read_at(0, &mut back), Ok(PAGE));
        assert_eq!(back, data);
    }

    #[test]
    fn short_file_tail_is_filled_on_first_touch() {
        testing::setup(64);
        let space = AddressSpace::new().unwrap();
        let file = MemFile::shared(&[0x5A; 100]);
        let addr = space
            .mmap(0, 3 * PAGE, Protection::READ, MapFlags::PRIVATE, Some(file), 0)
            .unwrap();
        assert_eq!(space.usage().pages, 1);

        let page = read(&space, addr, PAGE);
        assert!(page[..100].iter().all(|&b| b == 0x5A));
        assert!(page[100..].iter().all(|&b| b == 0));

        assert!(read(&space, addr + 2 * PAGE, PAGE).iter().all(|&b| b == 0));
        assert_eq!(space.usage().pages, 3);
        assert_eq!(space.fault_counters().access, 1);
    }

    #[test]
    fn mremap_relocation_preserves_content() {
        testing::setup(64);
        let space = AddressSpace::new().unwrap();
        let a = space.mmap(0, PAGE, RW, ANON, None, 0).unwrap();
        let b = space.mmap(0, PAGE, RW, ANON, None, 0).unwrap();
        assert_eq!(b, a + PAGE);
        space.user_write(a, b"relocate me").unwrap();

        let moved = space
            .mremap(a.as_usize(), PAGE, 2 * PAGE, RemapFlags::MAYMOVE, 0)
            .unwrap();
        assert_ne!(moved, a);
        assert_eq!(read(&space, moved, 11), b"relocate me");
        space.user_write(moved + PAGE, b"grown").unwrap();
        assert!(space.region(a).is_none());
        assert_eq!(space.user_read(a, &mut [0u8; 1]), Err(VmError::Unrecoverable));
    }

    #[test]
    fn stack_grows_on_demand() {
        testing::setup(64);
        let space = AddressSpace::new().unwrap();
        space.set_layout(ProgramLayout {
            base: VirtualAddress::new(0x40_0000),
            size: PAGE,
            stack_top: VirtualAddress::new(0x7000_0000),
            stack_size: 8 * PAGE,
        });
        let sp = VirtualAddress::new(0x7000_0000 - 64);
        space.user_write(sp, &[1; 64]).unwrap();
        assert_eq!(read(&space, sp, 64), [1u8; 64]);
        assert_eq!(space.fault_counters().translation, 1);
    }

    #[test]
    fn prot_none_revocation_blocks_access() {
        testing::setup(64);
        let space = AddressSpace::new().unwrap();
        let addr = space
            .mmap(0x5000_0000, PAGE, RW, ANON | MapFlags::FIXED, None, 0)
            .unwrap();
        space.user_write(addr, b"ok").unwrap();
        space
            .mmap(0x5000_0000, PAGE, Protection::empty(), ANON | MapFlags::FIXED, None, 0)
            .unwrap();
        assert_eq!(space.user_read(addr, &mut [0u8; 2]), Err(VmError::Unrecoverable));
    }

    #[test]
    fn file_handles_are_released_with_the_address_space() {
        testing::setup(64);
        let file = MemFile::shared(&[0u8; PAGE]);
        let before = testing::free_frames();
        {
            let space = AddressSpace::new().unwrap();
            let handle: FileHandle = file.clone();
            space
                .mmap(0, PAGE, RW, MapFlags::PRIVATE, Some(handle), 0)
                .unwrap();
            let child = space.fork().unwrap();
            child.user_write(VirtualAddress::new(arch::MMAP_BASE), b"child").unwrap();
            assert_eq!(Arc::strong_count(&file), 3);
        }
        assert_eq!(Arc::strong_count(&file), 1);
        assert_eq!(testing::free_frames(), before);
    }
}
