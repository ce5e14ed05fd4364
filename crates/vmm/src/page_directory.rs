//! Architecture-independent page table management.
//!
//! This module provides the `PageDirectory` type, which owns the root of a four-level
//! radix tree and provides high-level operations for mapping, unmapping, copying and
//! tearing down an address space's translations.
//!
//! Tables are never held by reference across calls: each one is a physical frame, reached
//! through the direct map whenever it is needed. This is what lets the kernel edit a
//! directory that is not installed on the current processor.
//!
//! Every present leaf holds exactly one reference on the frame it points at. Dropping the
//! directory therefore only has to drop one reference per leaf, whatever kind of mapping
//! the leaf came from.

use alloc::vec::Vec;

use crate::{
    FrameAllocator, PhysicalAddress, VirtualAddress, VmError, VmResult,
    arch::{self, PageEntry, PageFlags, PageTable},
    frame_allocator::{copy_frame, zero_frame},
};

/// Number of virtual address bits consumed by each table level.
const INDEX_BITS: usize = arch::ENTRY_COUNT.trailing_zeros() as usize;

/// How [`PageDirectory::copy`] duplicates private pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    /// Allocate a fresh frame for every private page and copy its bytes.
    Duplicate,
    /// Share every private page and write-protect writable ones in both directories;
    /// the first write from either side takes a permission fault and copies.
    CopyOnWrite,
}

/// One node reported by [`PageDirectory::traverse`].
pub enum Node<'a> {
    /// A present leaf entry and the virtual address it translates.
    Leaf {
        va: VirtualAddress,
        entry: &'a mut PageEntry,
    },
    /// A table frame, reported after all of its children.
    Table { level: usize, phys: PhysicalAddress },
}

/// Counts of frames reachable from a directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryUsage {
    /// Present leaf entries.
    pub pages: usize,
    /// Table frames, including the root.
    pub tables: usize,
}

/// Returns the table stored in the frame at `phys`.
///
/// # Safety
/// `phys` must be a table frame owned by a live directory, and the caller must not create
/// overlapping references to it.
unsafe fn table_at<'a>(phys: PhysicalAddress) -> &'a mut PageTable {
    unsafe { &mut *VirtualAddress::direct_mapped(phys).as_mut_ptr::<PageTable>() }
}

/// Returns the direct-map pointer to the byte at `offset` inside the frame at `phys`.
fn frame_ptr(phys: PhysicalAddress, offset: usize) -> *mut u8 {
    VirtualAddress::direct_mapped(phys + offset).as_mut_ptr::<u8>()
}

/// Visits every present entry below `phys` in post order.
fn traverse_table(
    phys: PhysicalAddress,
    level: usize,
    base: usize,
    visit: &mut dyn FnMut(Node<'_>) -> VmResult<()>,
) -> VmResult<()> {
    // SAFETY: only tables reachable from a live directory are traversed.
    let table = unsafe { table_at(phys) };
    for index in 0..arch::ENTRY_COUNT {
        let entry = table.entry_mut(index);
        if !entry.is_present() {
            continue;
        }
        let va = base | (index << (arch::PAGE_SHIFT + level * INDEX_BITS));
        if level == 0 {
            visit(Node::Leaf {
                va: VirtualAddress::new(arch::canonicalize_virtual(va)),
                entry,
            })?;
        } else if let Some(next) = entry.address() {
            traverse_table(next, level - 1, va, visit)?;
        }
    }
    visit(Node::Table { level, phys })
}

/// An architecture-independent page table manager.
///
/// This type owns the root page table and provides operations for mapping and unmapping
/// virtual addresses to physical addresses. It handles walking the page table hierarchy
/// and allocating intermediate tables as needed.
pub struct PageDirectory {
    root: PhysicalAddress,
}

impl PageDirectory {
    /// Creates a new page directory with an empty root page table.
    pub fn new() -> VmResult<Self> {
        let root = FrameAllocator::current().allocate_zeroed()?;
        log::trace!("created page directory with root {}", root);
        Ok(Self { root })
    }

    /// Returns the physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Walks to the leaf slot for `va`.
    ///
    /// When `allocate` is set, missing interior tables are allocated, zeroed and linked
    /// in. Otherwise a missing table fails with [`VmError::NotMapped`]. The returned slot
    /// may or may not be present.
    pub fn walk(&mut self, va: VirtualAddress, allocate: bool) -> VmResult<&mut PageEntry> {
        let mut phys = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: phys is the root or a table linked from it; &mut self is exclusive.
            let table = unsafe { table_at(phys) };
            let entry = table.entry_mut(va.page_index(level));
            if !entry.is_present() {
                if !allocate {
                    return Err(VmError::NotMapped);
                }
                let frame = FrameAllocator::current().allocate_zeroed()?;
                *entry = PageEntry::table(frame);
            }
            phys = entry.address().ok_or(VmError::NotMapped)?;
        }

        // SAFETY: as above.
        let table = unsafe { table_at(phys) };
        Ok(table.entry_mut(va.page_index(0)))
    }

    /// Returns the present leaf entry translating `va`, if any.
    pub fn entry(&self, va: VirtualAddress) -> Option<PageEntry> {
        let mut phys = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: read-only access to a table owned by this directory.
            let table = unsafe { table_at(phys) };
            phys = table.entry(va.page_index(level)).address()?;
        }
        // SAFETY: as above.
        let entry = unsafe { table_at(phys) }.entry(va.page_index(0));
        entry.is_present().then_some(entry)
    }

    /// Translates `va` to the physical address it maps to.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.entry(va)
            .and_then(|entry| entry.address())
            .map(|frame| frame + va.page_offset())
    }

    /// Installs a single leaf mapping `va` to the frame at `pa`.
    ///
    /// The directory takes over one reference on `pa`, which the caller must already hold.
    pub fn map_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> VmResult<()> {
        assert!(va.is_page_aligned(), "virtual address must be page-aligned");
        assert!(pa.is_page_aligned(), "physical address must be page-aligned");

        let entry = self.walk(va, true)?;
        if entry.is_present() {
            return Err(VmError::AlreadyMapped);
        }
        let mut flags = flags;
        flags.set_present(true);
        *entry = PageEntry::new(pa, flags);

        #[cfg(feature = "detailed-logging")]
        log::trace!("map {} -> {}", va, pa);

        Ok(())
    }

    /// Maps `size` bytes (rounded up to pages) of physically contiguous memory at `pa` to
    /// `va` with the default user data profile.
    ///
    /// Fails with [`VmError::AlreadyMapped`] rather than overwriting a present entry. On
    /// failure every entry installed by this call is removed again and the frames stay
    /// with the caller.
    pub fn map(&mut self, va: VirtualAddress, size: usize, pa: PhysicalAddress) -> VmResult<()> {
        let pages = arch::pages_for(size);
        for i in 0..pages {
            let offset = i * arch::PAGE_SIZE;
            if let Err(err) = self.map_page(va + offset, pa + offset, PageFlags::user_data()) {
                for j in 0..i {
                    let page = va + j * arch::PAGE_SIZE;
                    if let Ok(entry) = self.walk(page, false) {
                        entry.clear();
                    }
                    arch::flush_page(page);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Removes `count` leaf entries starting at `va`, dropping each frame's reference and
    /// releasing frames that are no longer referenced.
    ///
    /// # Panics
    ///
    /// Panics if any page in the range is not mapped.
    pub fn unmap(&mut self, va: VirtualAddress, count: usize) {
        assert!(va.is_page_aligned(), "virtual address must be page-aligned");
        let allocator = FrameAllocator::current();
        for i in 0..count {
            let page = va + i * arch::PAGE_SIZE;
            let frame = match self.walk(page, false) {
                Ok(entry) if entry.is_present() => {
                    let frame = entry.address();
                    entry.clear();
                    frame
                }
                _ => None,
            };
            let Some(frame) = frame else {
                panic!("unmap of unmapped page {}", page);
            };
            arch::flush_page(page);
            allocator.put(frame);
        }
    }

    /// Rewrites the flags of the present leaf at `va`.
    pub fn protect(
        &mut self,
        va: VirtualAddress,
        update: impl FnOnce(&mut PageFlags),
    ) -> VmResult<()> {
        let entry = self.walk(va, false)?;
        if !entry.is_present() {
            return Err(VmError::NotMapped);
        }
        let mut flags = entry.flags();
        update(&mut flags);
        entry.set_flags(flags);
        arch::flush_page(va);
        Ok(())
    }

    /// Reads bytes starting at `va` into `buf`, ignoring access permissions.
    pub fn read(&self, va: VirtualAddress, buf: &mut [u8]) -> VmResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = va + done;
            let chunk = (arch::PAGE_SIZE - at.page_offset()).min(buf.len() - done);
            let phys = self.translate(at).ok_or(VmError::NotMapped)?;
            // SAFETY: the chunk stays within one mapped frame.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    frame_ptr(phys, 0),
                    buf[done..].as_mut_ptr(),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    /// Writes `data` starting at `va`, ignoring access permissions.
    pub fn write(&mut self, va: VirtualAddress, data: &[u8]) -> VmResult<()> {
        let mut done = 0;
        while done < data.len() {
            let at = va + done;
            let chunk = (arch::PAGE_SIZE - at.page_offset()).min(data.len() - done);
            let phys = self.translate(at).ok_or(VmError::NotMapped)?;
            // SAFETY: the chunk stays within one mapped frame.
            unsafe {
                core::ptr::copy_nonoverlapping(data[done..].as_ptr(), frame_ptr(phys, 0), chunk);
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies `len` bytes of `source` to `va`, allocating zeroed user data pages for any
    /// destination page that is not mapped yet. With no source the range is zero-filled.
    ///
    /// The directory does not need to be active.
    pub fn copy_to_user(
        &mut self,
        va: VirtualAddress,
        source: Option<&[u8]>,
        len: usize,
    ) -> VmResult<()> {
        if let Some(source) = source {
            assert!(source.len() >= len, "copy source shorter than length");
        }
        let allocator = FrameAllocator::current();
        let mut done = 0;
        while done < len {
            let at = va + done;
            let page = at.align_down(arch::PAGE_SIZE);
            let chunk = (arch::PAGE_SIZE - at.page_offset()).min(len - done);

            let entry = self.walk(page, true)?;
            let frame = match entry.address() {
                // Still shared copy-on-write with another directory.
                Some(frame) if !entry.flags().is_writable() && allocator.ref_count(frame) > 1 => {
                    self.make_private(page)?
                }
                Some(frame) => frame,
                None => {
                    let frame = allocator.allocate_zeroed()?;
                    *entry = PageEntry::new(frame, PageFlags::user_data());
                    frame
                }
            };

            let dst = frame_ptr(frame, at.page_offset());
            // SAFETY: the chunk stays within the destination frame.
            unsafe {
                match source {
                    Some(source) => {
                        core::ptr::copy_nonoverlapping(source[done..].as_ptr(), dst, chunk)
                    }
                    None => core::ptr::write_bytes(dst, 0, chunk),
                }
            }
            done += chunk;
        }
        Ok(())
    }

    /// Gives the leaf at `page` a writable frame of its own and returns that frame.
    ///
    /// A frame referenced only by this leaf is simply made writable again. Otherwise the
    /// contents are copied to a new frame and the reference on the old one is dropped.
    pub fn make_private(&mut self, page: VirtualAddress) -> VmResult<PhysicalAddress> {
        let allocator = FrameAllocator::current();
        let entry = self.walk(page, false)?;
        let old = entry.address().ok_or(VmError::NotMapped)?;
        let mut flags = entry.flags();
        flags.set_writable(true);

        if allocator.ref_count(old) == 1 {
            entry.set_flags(flags);
            arch::flush_page(page);
            log::trace!("reclaimed sole copy of {} at {}", old, page);
            return Ok(old);
        }

        let new = allocator.allocate()?;
        copy_frame(new, old);
        *entry = PageEntry::new(new, flags);
        arch::flush_page(page);
        allocator.put(old);
        log::trace!("copied {} to {} for {}", old, new, page);
        Ok(new)
    }

    /// Visits every present leaf and every table frame in post order, root last.
    ///
    /// Stops at the first error the visitor returns.
    pub fn traverse(
        &mut self,
        mut visit: impl FnMut(Node<'_>) -> VmResult<()>,
    ) -> VmResult<()> {
        traverse_table(self.root, arch::PAGE_TABLE_LEVELS - 1, 0, &mut visit)
    }

    /// Counts the leaves and tables reachable from the root.
    pub fn usage(&self) -> DirectoryUsage {
        let mut usage = DirectoryUsage::default();
        let _ = traverse_table(
            self.root,
            arch::PAGE_TABLE_LEVELS - 1,
            0,
            &mut |node| {
                match node {
                    Node::Leaf { .. } => usage.pages += 1,
                    Node::Table { .. } => usage.tables += 1,
                }
                Ok(())
            },
        );
        usage
    }

    /// Returns the number of present leaf entries.
    pub fn mapped_pages(&self) -> usize {
        self.usage().pages
    }

    /// Builds a new directory with the same translations.
    ///
    /// Pages for which `is_shared` holds point at the same frame in both directories.
    /// Other pages are duplicated according to `mode`. If anything fails, the partially
    /// built directory is torn down and pages write-protected so far are made writable
    /// again before the error is returned.
    pub fn copy(
        &mut self,
        mode: CopyMode,
        is_shared: impl Fn(VirtualAddress) -> bool,
    ) -> VmResult<PageDirectory> {
        let allocator = FrameAllocator::current();
        let mut child = PageDirectory::new()?;
        let mut protected = Vec::new();

        let result = self.traverse(|node| {
            let Node::Leaf { va, entry } = node else {
                return Ok(());
            };
            let frame = entry.address().ok_or(VmError::NotMapped)?;
            let mut flags = entry.flags();

            if is_shared(va) {
                child.map_page(va, frame, flags)?;
                allocator.inc_ref(frame);
                return Ok(());
            }

            match mode {
                CopyMode::Duplicate => {
                    let copy = allocator.allocate()?;
                    copy_frame(copy, frame);
                    if let Err(err) = child.map_page(va, copy, flags) {
                        allocator.put(copy);
                        return Err(err);
                    }
                }
                CopyMode::CopyOnWrite => {
                    flags.set_writable(false);
                    child.map_page(va, frame, flags)?;
                    allocator.inc_ref(frame);
                    if entry.flags().is_writable() {
                        entry.set_flags(flags);
                        arch::flush_page(va);
                        protected.push(va);
                    }
                }
            }
            Ok(())
        });

        if let Err(err) = result {
            drop(child);
            for va in protected {
                let _ = self.protect(va, |flags| flags.set_writable(true));
            }
            log::debug!("copy of page directory {} failed: {}", self.root, err);
            return Err(err);
        }

        log::debug!(
            "copied page directory {} into {} ({:?})",
            self.root,
            child.root,
            mode
        );
        Ok(child)
    }

    /// Drops every leaf reference and releases every table frame, root included.
    fn free(&mut self) {
        let allocator = FrameAllocator::current();
        let _ = self.traverse(|node| {
            match node {
                Node::Leaf { va, entry } => {
                    if let Some(frame) = entry.address() {
                        entry.clear();
                        arch::flush_page(va);
                        allocator.put(frame);
                    }
                }
                Node::Table { phys, .. } => {
                    allocator.put(phys);
                }
            }
            Ok(())
        });
        log::trace!("freed page directory with root {}", self.root);
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        self.free();
    }
}
