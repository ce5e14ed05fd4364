//! Page-fault resolution.
//!
//! The trap dispatcher classifies the exception and hands it to
//! [`AddressSpace::handle_fault`]. A fault is either fixed up (the faulting access can be
//! retried) or reported as [`VmError::Unrecoverable`], in which case the process must be
//! terminated.

use crate::{
    AddressSpace, FrameAllocator, MapFlags, PageFlags, Protection, VirtualAddress, VmError,
    VmResult,
    address_space::AddressSpaceInner,
    arch,
    mapping::{Populate, populate},
};

/// Class of a page fault, as reported by the MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No translation exists for the address.
    Translation,
    /// A translation is missing its access flag, or the page is not populated yet.
    Access,
    /// A translation exists but forbids the access.
    Permission,
}

impl FaultKind {
    /// Decodes an ARM data/instruction fault status code (the low six bits of the
    /// exception syndrome).
    pub fn from_syndrome(syndrome: u32) -> Option<FaultKind> {
        match syndrome & 0x3F {
            0b00_0100..=0b00_0111 => Some(Self::Translation),
            0b00_1000..=0b00_1011 => Some(Self::Access),
            0b00_1100..=0b00_1111 => Some(Self::Permission),
            _ => None,
        }
    }
}

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

/// A fault event handed over by the trap dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub kind: FaultKind,
    pub access: AccessType,
}

impl PageFault {
    pub const fn new(address: VirtualAddress, kind: FaultKind, access: AccessType) -> Self {
        Self {
            address,
            kind,
            access,
        }
    }

    /// Builds a fault from an x86 page-fault error code and the faulting address in `CR2`.
    #[cfg(target_arch = "x86_64")]
    pub fn from_error_code(address: VirtualAddress, code: u64) -> Self {
        use x86_64::structures::idt::PageFaultErrorCode;

        let code = PageFaultErrorCode::from_bits_truncate(code);
        let kind = if code.contains(PageFaultErrorCode::PROTECTION_VIOLATION) {
            FaultKind::Permission
        } else {
            FaultKind::Translation
        };
        let access = if code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
            AccessType::Execute
        } else if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
            AccessType::Write
        } else {
            AccessType::Read
        };
        Self::new(address, kind, access)
    }
}

impl AddressSpaceInner {
    fn resolve(&mut self, fault: PageFault) -> VmResult<()> {
        let va = fault.address;
        if va.as_usize() >= arch::USER_SPACE_TOP {
            return Err(VmError::Unrecoverable);
        }
        let page = va.align_down(arch::PAGE_SIZE);

        match fault.kind {
            FaultKind::Translation | FaultKind::Access => {
                if self.directory.entry(page).is_some() {
                    // Stale translation.
                    arch::flush_page(page);
                    return Ok(());
                }

                if let Some(region) = self.regions.find_region(va).cloned() {
                    if !permits(region.prot, fault.access) {
                        return Err(VmError::Unrecoverable);
                    }
                    let pages = populate(&mut self.directory, &region, Populate::Holes)?;
                    log::trace!("populated {} pages of {}..{}", pages, region.start, region.end());
                    self.faults.access += 1;
                    arch::flush_all();
                    return Ok(());
                }

                if self.layout.contains(va) {
                    let allocator = FrameAllocator::current();
                    let frame = allocator.allocate_zeroed()?;
                    if let Err(err) = self.directory.map_page(page, frame, PageFlags::user_data()) {
                        allocator.put(frame);
                        return Err(err);
                    }
                    log::trace!("demand page {} -> {}", page, frame);
                    self.faults.translation += 1;
                    return Ok(());
                }

                Err(VmError::Unrecoverable)
            }
            FaultKind::Permission => {
                if fault.access != AccessType::Write {
                    return Err(VmError::Unrecoverable);
                }
                let entry = self.directory.entry(page).ok_or(VmError::Unrecoverable)?;
                let flags = entry.flags();
                if !flags.is_user() {
                    return Err(VmError::Unrecoverable);
                }
                if flags.is_writable() {
                    arch::flush_page(page);
                    return Ok(());
                }

                let copy_on_write = match self.regions.find_region(va) {
                    Some(region) => {
                        !region.flags.contains(MapFlags::SHARED)
                            && region.prot.contains(Protection::WRITE)
                    }
                    None => self.layout.contains(va),
                };
                if !copy_on_write {
                    return Err(VmError::Unrecoverable);
                }
                self.directory.make_private(page)?;
                self.faults.copy_on_write += 1;
                Ok(())
            }
        }
    }
}

fn permits(prot: Protection, access: AccessType) -> bool {
    match access {
        AccessType::Read => prot.contains(Protection::READ),
        AccessType::Write => prot.contains(Protection::WRITE),
        AccessType::Execute => prot.contains(Protection::EXEC),
    }
}

impl AddressSpace {
    /// Resolves a page fault taken while this address space was active.
    ///
    /// Returns `Ok` if the access can be retried. Any other outcome is
    /// [`VmError::Unrecoverable`]; allocation and file errors met while resolving are
    /// logged and folded into it.
    pub fn handle_fault(&self, fault: PageFault) -> VmResult<()> {
        let result = self.inner.lock().resolve(fault);
        result.map_err(|err| {
            log::warn!(
                "unrecoverable {:?} fault on {:?} at {}: {}",
                fault.kind,
                fault.access,
                fault.address,
                err
            );
            VmError::Unrecoverable
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProgramLayout, testing, testing::MemFile};

    const PAGE: usize = arch::PAGE_SIZE;
    const RW: Protection = Protection::READ.union(Protection::WRITE);
    const ANON: MapFlags = MapFlags::PRIVATE.union(MapFlags::ANONYMOUS);

    fn space() -> AddressSpace {
        testing::setup(128);
        let space = AddressSpace::new().unwrap();
        space.set_layout(ProgramLayout {
            base: VirtualAddress::new(0x40_0000),
            size: 2 * PAGE,
            stack_top: VirtualAddress::new(0x7000_0000),
            stack_size: 2 * PAGE,
        });
        space
    }

    fn write_fault(address: VirtualAddress) -> PageFault {
        PageFault::new(address, FaultKind::Permission, AccessType::Write)
    }

    fn missing(address: VirtualAddress, access: AccessType) -> PageFault {
        PageFault::new(address, FaultKind::Translation, access)
    }

    #[test]
    fn syndrome_decoding() {
        assert_eq!(FaultKind::from_syndrome(0b00_0111), Some(FaultKind::Translation));
        assert_eq!(FaultKind::from_syndrome(0b00_1001), Some(FaultKind::Access));
        assert_eq!(FaultKind::from_syndrome(0x4F), Some(FaultKind::Permission));
        assert_eq!(FaultKind::from_syndrome(0b01_0000), None);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn error_code_decoding() {
        let va = VirtualAddress::new(0x1000);
        let fault = PageFault::from_error_code(va, 0b0110);
        assert_eq!(fault.kind, FaultKind::Translation);
        assert_eq!(fault.access, AccessType::Write);
        let fault = PageFault::from_error_code(va, 0b10101);
        assert_eq!(fault.kind, FaultKind::Permission);
        assert_eq!(fault.access, AccessType::Execute);
    }

    #[test]
    fn stack_and_image_pages_are_demand_allocated() {
        let space = space();
        let stack = VirtualAddress::new(0x7000_0000 - 8);
        space.handle_fault(missing(stack, AccessType::Write)).unwrap();
        space.handle_fault(missing(VirtualAddress::new(0x40_0010), AccessType::Read)).unwrap();
        assert!(space.translate(stack).is_some());
        assert_eq!(space.fault_counters().translation, 2);
    }

    #[test]
    fn address_outside_everything_is_unrecoverable() {
        let space = space();
        for address in [0x40_0000 + 2 * PAGE, 0x7000_0000, 0x1234_5000] {
            assert_eq!(
                space.handle_fault(missing(VirtualAddress::new(address), AccessType::Read)),
                Err(VmError::Unrecoverable)
            );
        }
        assert_eq!(
            space.handle_fault(missing(
                VirtualAddress::new(0xFFFF_8000_0000_0000),
                AccessType::Read
            )),
            Err(VmError::Unrecoverable)
        );
    }

    #[test]
    fn present_page_fault_is_spurious() {
        let space = space();
        let addr = space.mmap(0, PAGE, RW, ANON, None, 0).unwrap();
        assert_eq!(space.handle_fault(missing(addr, AccessType::Read)), Ok(()));
        assert_eq!(space.fault_counters(), Default::default());
    }

    #[test]
    fn access_fault_populates_past_end_of_file() {
        let space = space();
        let contents: alloc::vec::Vec<u8> = (0..PAGE + 10).map(|i| i as u8 | 1).collect();
        let file = MemFile::shared(&contents);
        let addr = space
            .mmap(0, 4 * PAGE, Protection::READ, MapFlags::PRIVATE, Some(file), 0)
            .unwrap();
        assert_eq!(space.usage().pages, 2);

        let fault = PageFault::new(addr + 3 * PAGE, FaultKind::Access, AccessType::Read);
        space.handle_fault(fault).unwrap();
        assert_eq!(space.usage().pages, 4);
        assert_eq!(space.fault_counters().access, 1);

        let mut buf = alloc::vec![0xEEu8; 2 * PAGE];
        space.read(addr + 2 * PAGE, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn access_fault_checks_region_protection() {
        let space = space();
        let file = MemFile::shared(&[]);
        let addr = space
            .mmap(0, PAGE, Protection::READ, MapFlags::PRIVATE, Some(file), 0)
            .unwrap();
        assert_eq!(
            space.handle_fault(missing(addr, AccessType::Write)),
            Err(VmError::Unrecoverable)
        );
        assert_eq!(space.handle_fault(missing(addr, AccessType::Read)), Ok(()));
    }

    #[test]
    fn copy_on_write_after_fork_isolates_parent_and_child() {
        let parent = space();
        let allocator = FrameAllocator::current();
        let addr = parent.mmap(0, PAGE, RW, ANON, None, 0).unwrap();
        let shared = parent.translate(addr).unwrap();

        let child = parent.fork().unwrap();
        child.handle_fault(write_fault(addr)).unwrap();
        let copied = child.translate(addr).unwrap();
        assert_ne!(copied, shared);
        assert_eq!(allocator.ref_count(shared), 1);
        assert_eq!(allocator.ref_count(copied), 1);
        assert_eq!(child.fault_counters().copy_on_write, 1);

        // The parent is now the only user: its fault just restores write access.
        parent.handle_fault(write_fault(addr)).unwrap();
        assert_eq!(parent.translate(addr), Some(shared));
        let inner = parent.inner.lock();
        assert!(inner.directory.entry(addr).unwrap().flags().is_writable());
    }

    #[test]
    fn write_to_read_only_region_is_unrecoverable() {
        let space = space();
        let addr = space
            .mmap(0, PAGE, Protection::READ, ANON, None, 0)
            .unwrap();
        assert_eq!(space.handle_fault(write_fault(addr)), Err(VmError::Unrecoverable));
    }

    #[test]
    fn write_to_shared_read_only_page_is_unrecoverable() {
        let space = space();
        let addr = space
            .mmap(0, PAGE, RW, MapFlags::SHARED | MapFlags::ANONYMOUS, None, 0)
            .unwrap();
        space
            .inner
            .lock()
            .directory
            .protect(addr, |flags| flags.set_writable(false))
            .unwrap();
        assert_eq!(space.handle_fault(write_fault(addr)), Err(VmError::Unrecoverable));
    }

    #[test]
    fn read_permission_fault_is_unrecoverable() {
        let space = space();
        let addr = space.mmap(0, PAGE, Protection::empty(), ANON, None, 0).unwrap();
        let fault = PageFault::new(addr, FaultKind::Permission, AccessType::Read);
        assert_eq!(space.handle_fault(fault), Err(VmError::Unrecoverable));
        assert_eq!(space.handle_fault(write_fault(addr)), Err(VmError::Unrecoverable));
    }

    #[test]
    fn failed_copy_is_unrecoverable_and_leaves_sharing_intact() {
        testing::setup(16);
        let allocator = FrameAllocator::current();
        let parent = AddressSpace::new().unwrap();
        let addr = parent.mmap(0, PAGE, RW, ANON, None, 0).unwrap();
        let frame = parent.translate(addr).unwrap();
        let child = parent.fork().unwrap();

        let mut hoard = alloc::vec::Vec::new();
        while let Ok(frame) = allocator.allocate() {
            hoard.push(frame);
        }
        assert_eq!(child.handle_fault(write_fault(addr)), Err(VmError::Unrecoverable));
        assert_eq!(child.translate(addr), Some(frame));
        assert_eq!(allocator.ref_count(frame), 2);
        for frame in hoard {
            allocator.put(frame);
        }
    }
}
