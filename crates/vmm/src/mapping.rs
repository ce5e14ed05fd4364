//! The `mmap` family: creating, removing, resizing and flushing regions.
//!
//! Arguments arrive from the system-call layer already copied in and bounds-checked, but
//! addresses are still raw integers so that misaligned or non-canonical values can be
//! rejected here with the right error.

use crate::{
    AddressSpace, FileHandle, FrameAllocator, MapFlags, PageDirectory, PageFlags, PageNumber,
    Protection, Region, RemapFlags, SyncFlags, VirtualAddress, VmError, VmResult,
    address_space::AddressSpaceInner,
    arch,
    file::read_full,
    frame_allocator::{copy_frame, frame_bytes},
};

/// How [`populate`] treats pages it finds already present and pages past end of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Populate {
    /// A brand new range: present pages are an error, and file-backed population stops at
    /// the first page wholly past end of file. Everything installed is removed on failure.
    Fresh,
    /// Fill the holes of an existing region: present pages are skipped and pages past end
    /// of file are zero-filled.
    Holes,
}

/// Installs frames for the pages of `region`, zeroed or read from its file.
pub(crate) fn populate(
    directory: &mut PageDirectory,
    region: &Region,
    mode: Populate,
) -> VmResult<usize> {
    let flags = region.prot.leaf_flags();
    let file_len = region.file.as_ref().map(|file| file.len());
    let mut installed = 0;

    let mut failure = None;
    for page in PageNumber::span(region.start, region.len).map(PageNumber::start) {
        if directory.entry(page).is_some() {
            if mode == Populate::Fresh {
                failure = Some((page, VmError::AlreadyMapped));
                break;
            }
            continue;
        }
        if mode == Populate::Fresh && file_len.is_some_and(|len| region.file_offset(page) >= len) {
            break;
        }
        if let Err(err) = populate_page(directory, region, page, flags) {
            failure = Some((page, err));
            break;
        }
        installed += 1;
    }

    let Some((reached, err)) = failure else {
        return Ok(installed);
    };
    if mode == Populate::Fresh {
        // Everything below `reached` that is present was installed by this call.
        for page in PageNumber::range(region.start, reached).map(PageNumber::start) {
            if directory.entry(page).is_some() {
                directory.unmap(page, 1);
            }
        }
    }
    log::debug!("population of {}..{} failed: {}", region.start, region.end(), err);
    Err(err)
}

/// Installs one zeroed or file-filled frame at `page`.
fn populate_page(
    directory: &mut PageDirectory,
    region: &Region,
    page: VirtualAddress,
    flags: PageFlags,
) -> VmResult<()> {
    let allocator = FrameAllocator::current();
    let frame = allocator.allocate_zeroed()?;
    if let Some(file) = region.file.as_deref() {
        // SAFETY: the frame was just allocated and is not mapped anywhere yet.
        let bytes = unsafe { frame_bytes(frame) };
        if let Err(err) = read_full(file, region.file_offset(page), bytes) {
            allocator.put(frame);
            return Err(err);
        }
    }
    if let Err(err) = directory.map_page(page, frame, flags) {
        allocator.put(frame);
        return Err(err);
    }

    #[cfg(feature = "detailed-logging")]
    log::trace!("populated {} with {}", page, frame);

    Ok(())
}

/// Rounds a byte length up to whole pages, failing if that overflows.
fn page_length(len: usize) -> VmResult<usize> {
    len.checked_add(arch::PAGE_SIZE - 1)
        .map(|len| len & !(arch::PAGE_SIZE - 1))
        .ok_or(VmError::OutOfMemory)
}

/// Checks that `[start, start + len)` is a canonical range below the top of user space.
fn user_range(start: VirtualAddress, len: usize) -> VmResult<VirtualAddress> {
    match start.checked_add(len) {
        Some(end) if end.as_usize() <= arch::USER_SPACE_TOP => Ok(end),
        _ => Err(VmError::OutOfMemory),
    }
}

/// Parses a page-aligned, canonical user address.
fn aligned_address(addr: usize) -> VmResult<VirtualAddress> {
    VirtualAddress::try_new(addr)
        .filter(|va| va.is_page_aligned())
        .ok_or(VmError::InvalidArgument)
}

impl AddressSpaceInner {
    /// Revokes user access to every present page in `[start, end)`.
    fn revoke(&mut self, start: VirtualAddress, end: VirtualAddress) {
        for page in PageNumber::range(start, end).map(PageNumber::start) {
            // Holes in the range are left alone.
            let _ = self.directory.protect(page, |flags| flags.set_user(false));
        }
    }

    fn any_present(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        PageNumber::range(start, end)
            .map(PageNumber::start)
            .any(|page| self.directory.entry(page).is_some())
    }

    /// Maps `region` at its (usable) start and records it.
    fn commit(&mut self, region: Region) -> VmResult<VirtualAddress> {
        let pages = populate(&mut self.directory, &region, Populate::Fresh)?;
        let start = region.start;
        log::debug!(
            "mapped {}..{} ({} of {} pages populated)",
            start,
            region.end(),
            pages,
            region.pages()
        );
        self.regions.insert(region);
        Ok(start)
    }

    fn munmap(&mut self, start: VirtualAddress, end: VirtualAddress) -> VmResult<()> {
        let covered = self.regions.overlapping(start, end);

        // Flush everything first so a failed write leaves the mappings intact.
        for &key in &covered {
            let Some(region) = self.regions.find_region(key) else {
                continue;
            };
            if region.needs_write_back() {
                let from = region.start.max(start);
                let to = region.end().min(end);
                self.write_back(region, from, to)?;
            }
        }

        for key in covered {
            let Some(region) = self.regions.remove(key) else {
                continue;
            };
            let from = region.start.max(start);
            let to = region.end().min(end);
            self.unmap_present(from, to);
            if region.start < from {
                self.regions.insert(region.slice(region.start, from));
            }
            if to < region.end() {
                self.regions.insert(region.slice(to, region.end()));
            }
        }
        Ok(())
    }

    /// Moves `region` to `new_start` with `new_len` bytes, carrying its contents along.
    fn relocate(
        &mut self,
        region: Region,
        new_start: VirtualAddress,
        new_len: usize,
    ) -> VmResult<VirtualAddress> {
        let moved = Region {
            start: new_start,
            len: new_len,
            ..region.clone()
        };
        populate(&mut self.directory, &moved, Populate::Fresh)?;

        if let Err(err) = self.carry_pages(&region, &moved) {
            self.unmap_present(moved.start, moved.end());
            return Err(err);
        }
        if region.needs_write_back() {
            if let Err(err) = self.write_back(&region, region.start, region.end()) {
                self.unmap_present(moved.start, moved.end());
                return Err(err);
            }
        }

        self.unmap_present(region.start, region.end());
        self.regions.remove(region.start);
        arch::flush_all();
        log::debug!(
            "moved {}..{} to {}..{}",
            region.start,
            region.end(),
            moved.start,
            moved.end()
        );
        self.regions.insert(moved);
        Ok(new_start)
    }

    /// Copies every present page of `from` into the matching page of `to`, installing a
    /// page where `to` has none.
    fn carry_pages(&mut self, from: &Region, to: &Region) -> VmResult<()> {
        let allocator = FrameAllocator::current();
        let flags = to.prot.leaf_flags();
        let pages = from.pages().min(to.pages());
        for i in 0..pages {
            let src_page = from.start + i * arch::PAGE_SIZE;
            let dst_page = to.start + i * arch::PAGE_SIZE;
            let Some(src) = self.directory.entry(src_page).and_then(|e| e.address()) else {
                continue;
            };
            match self.directory.entry(dst_page).and_then(|e| e.address()) {
                Some(dst) => copy_frame(dst, src),
                None => {
                    let dst = allocator.allocate()?;
                    copy_frame(dst, src);
                    if let Err(err) = self.directory.map_page(dst_page, dst, flags) {
                        allocator.put(dst);
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }
}

impl AddressSpace {
    /// Creates a mapping and returns its start address.
    ///
    /// `addr` is a hint, or the exact address with `MapFlags::FIXED`. Exactly one of
    /// `SHARED` and `PRIVATE` must be set. Unless `ANONYMOUS` is set, `file` supplies the
    /// contents starting at the page-aligned `offset`.
    ///
    /// Pages are populated eagerly: anonymous pages are zeroed, file pages are read up to
    /// end of file. Pages wholly past end of file stay absent until first touched.
    ///
    /// A fixed request with no access over pages that are already mapped revokes user
    /// access to them instead of creating a region.
    pub fn mmap(
        &self,
        addr: usize,
        len: usize,
        prot: Protection,
        flags: MapFlags,
        file: Option<FileHandle>,
        offset: usize,
    ) -> VmResult<VirtualAddress> {
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let len = page_length(len)?;
        if flags.contains(MapFlags::SHARED) == flags.contains(MapFlags::PRIVATE) {
            return Err(VmError::InvalidArgument);
        }
        let (file, offset) = if flags.contains(MapFlags::ANONYMOUS) {
            (None, 0)
        } else {
            let file = file.ok_or(VmError::InvalidArgument)?;
            if offset % arch::PAGE_SIZE != 0 {
                return Err(VmError::InvalidArgument);
            }
            (Some(file), offset)
        };

        let mut inner = self.inner.lock();

        let start = if flags.contains(MapFlags::FIXED) {
            if addr == 0 {
                return Err(VmError::InvalidArgument);
            }
            let start = aligned_address(addr)?;
            let end = user_range(start, len)?;
            if prot.is_empty() && inner.any_present(start, end) {
                inner.revoke(start, end);
                log::debug!("revoked user access to {}..{}", start, end);
                return Ok(start);
            }
            if !inner.regions.is_usable(start, len) {
                return Err(VmError::AlreadyMapped);
            }
            start
        } else {
            let hint = VirtualAddress::try_new(addr)
                .map(|va| va.align_down(arch::PAGE_SIZE))
                .filter(|va| va.as_usize() != 0)
                .filter(|&va| user_range(va, len).is_ok() && inner.regions.is_usable(va, len));
            match hint {
                Some(hint) => hint,
                None => inner
                    .regions
                    .find_address(VirtualAddress::new(arch::MMAP_BASE), len)?,
            }
        };

        inner.commit(Region {
            start,
            len,
            prot,
            flags: flags & (MapFlags::SHARED | MapFlags::PRIVATE | MapFlags::ANONYMOUS),
            file,
            offset,
        })
    }

    /// Removes every mapping in `[addr, addr + len)`.
    ///
    /// The range may cover several regions and cut any of them at either end or in the
    /// middle. Shared writable file mappings are written back before their pages go.
    /// Unmapping a range with no mappings succeeds.
    pub fn munmap(&self, addr: usize, len: usize) -> VmResult<()> {
        let start = aligned_address(addr)?;
        if len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let len = page_length(len).map_err(|_| VmError::InvalidArgument)?;
        let end = start.checked_add(len).ok_or(VmError::InvalidArgument)?;
        self.inner.lock().munmap(start, end)
    }

    /// Resizes the region starting at `old_addr`, moving it if allowed.
    ///
    /// `old_len` must match the region's length. The region grows or shrinks in place when
    /// possible. With `RemapFlags::FIXED` it moves to `new_addr`; otherwise it only moves
    /// when in-place growth is blocked and `RemapFlags::MAYMOVE` is set.
    pub fn mremap(
        &self,
        old_addr: usize,
        old_len: usize,
        new_len: usize,
        flags: RemapFlags,
        new_addr: usize,
    ) -> VmResult<VirtualAddress> {
        let old_start = aligned_address(old_addr)?;
        if new_len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let old_len = page_length(old_len)?;
        let new_len = page_length(new_len)?;

        let mut inner = self.inner.lock();
        let region = match inner.regions.find_region(old_start) {
            Some(region) if region.start == old_start && region.len == old_len => region.clone(),
            _ => return Err(VmError::InvalidArgument),
        };

        if flags.contains(RemapFlags::FIXED) {
            let new_start = aligned_address(new_addr)?;
            if new_start.as_usize() == 0 {
                return Err(VmError::InvalidArgument);
            }
            let new_end = user_range(new_start, new_len)?;
            if new_start < region.end() && region.start < new_end {
                return Err(VmError::InvalidArgument);
            }
            if !inner.regions.is_usable(new_start, new_len) {
                return Err(VmError::AlreadyMapped);
            }
            return inner.relocate(region, new_start, new_len);
        }

        if new_len == old_len {
            return Ok(old_start);
        }

        if new_len < old_len {
            let cut = old_start + new_len;
            if region.needs_write_back() {
                inner.write_back(&region, cut, region.end())?;
            }
            inner.unmap_present(cut, region.end());
            inner.regions.remove(old_start);
            inner.regions.insert(Region {
                len: new_len,
                ..region
            });
            log::debug!("shrank {} to {:#x} bytes", old_start, new_len);
            return Ok(old_start);
        }

        let in_place = user_range(old_start, new_len)
            .ok()
            .filter(|_| inner.regions.is_usable(region.end(), new_len - old_len));
        if let Some(new_end) = in_place {
            let grown = Region {
                len: new_len,
                ..region.clone()
            };
            let tail = grown.slice(region.end(), new_end);
            populate(&mut inner.directory, &tail, Populate::Fresh)?;
            inner.regions.remove(old_start);
            inner.regions.insert(grown);
            log::debug!("grew {} to {:#x} bytes", old_start, new_len);
            return Ok(old_start);
        }

        if !flags.contains(RemapFlags::MAYMOVE) {
            return Err(VmError::OutOfMemory);
        }
        let new_start = inner
            .regions
            .find_address(VirtualAddress::new(arch::MMAP_BASE), new_len)?;
        inner.relocate(region, new_start, new_len)
    }

    /// Flushes shared writable file mappings in `[addr, addr + len)` to their files.
    ///
    /// `SyncFlags::ASYNC` alone does nothing, since write-back already happens at unmap
    /// and teardown. Parts of the range that are not mapped are ignored.
    pub fn msync(&self, addr: usize, len: usize, flags: SyncFlags) -> VmResult<()> {
        if flags.contains(SyncFlags::SYNC | SyncFlags::ASYNC) {
            return Err(VmError::InvalidArgument);
        }
        if !flags.contains(SyncFlags::SYNC) {
            return Ok(());
        }
        let start = aligned_address(addr)?;
        let len = page_length(len).map_err(|_| VmError::InvalidArgument)?;
        let end = start.checked_add(len).ok_or(VmError::InvalidArgument)?;

        let inner = self.inner.lock();
        for key in inner.regions.overlapping(start, end) {
            let Some(region) = inner.regions.find_region(key) else {
                continue;
            };
            if region.needs_write_back() {
                inner.write_back(region, region.start.max(start), region.end().min(end))?;
            }
        }
        Ok(())
    }
}
