//! Per-process tracking of mapped regions.
//!
//! Regions are kept in a map keyed by start address, so they are always ordered and
//! lookups are logarithmic. No two regions of one tracker overlap.

use alloc::collections::btree_map::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::{FileHandle, VirtualAddress, VmError, VmResult, arch, arch::PageFlags};

bitflags! {
    /// Access protection requested for a mapping.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct Protection: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Mapping flags accepted by `mmap`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

bitflags! {
    /// Flags accepted by `mremap`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct RemapFlags: u32 {
        const MAYMOVE = 0x1;
        const FIXED = 0x2;
    }
}

bitflags! {
    /// Flags accepted by `msync`.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SyncFlags: u32 {
        const ASYNC = 0x1;
        const INVALIDATE = 0x2;
        const SYNC = 0x4;
    }
}

impl Protection {
    /// Leaf flags for pages of a mapping with this protection.
    ///
    /// A mapping with no access at all keeps its pages present but not user-accessible.
    pub fn leaf_flags(self) -> PageFlags {
        let mut flags = PageFlags::user_data();
        flags.set_user(!self.is_empty());
        flags.set_writable(self.contains(Self::WRITE));
        flags.set_executable(self.contains(Self::EXEC));
        flags
    }
}

/// One contiguous mapped range of a process.
#[derive(Clone)]
pub struct Region {
    /// First address, page-aligned.
    pub start: VirtualAddress,
    /// Length in bytes, a whole number of pages.
    pub len: usize,
    pub prot: Protection,
    /// Sharing mode and `ANONYMOUS`; `FIXED` is never stored.
    pub flags: MapFlags,
    /// Backing file, `None` for anonymous mappings.
    pub file: Option<FileHandle>,
    /// File offset of `start`.
    pub offset: usize,
}

impl Region {
    /// Returns the first address past the region.
    pub fn end(&self) -> VirtualAddress {
        self.start + self.len
    }

    /// Returns the number of pages in the region.
    pub fn pages(&self) -> usize {
        self.len / arch::PAGE_SIZE
    }

    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end()
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
    }

    /// True if the mapping's changes must reach the file.
    pub fn needs_write_back(&self) -> bool {
        self.is_shared() && self.prot.contains(Protection::WRITE) && self.file.is_some()
    }

    /// File offset backing `va`.
    pub fn file_offset(&self, va: VirtualAddress) -> usize {
        self.offset + (va - self.start)
    }

    /// Returns the part of the region covering `[start, end)`, which must lie inside it.
    pub fn slice(&self, start: VirtualAddress, end: VirtualAddress) -> Region {
        debug_assert!(self.start <= start && end <= self.end() && start < end);
        Region {
            start,
            len: end - start,
            prot: self.prot,
            flags: self.flags,
            file: self.file.clone(),
            offset: self.file_offset(start),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("prot", &self.prot)
            .field("flags", &self.flags)
            .field("file", &self.file.is_some())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Ordered, non-overlapping set of regions belonging to one address space.
#[derive(Default)]
pub struct RegionTracker {
    regions: BTreeMap<VirtualAddress, Region>,
}

impl RegionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Iterates regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// True if `[addr, addr + len)` overlaps no region.
    pub fn is_usable(&self, addr: VirtualAddress, len: usize) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        match self.regions.range(..end).next_back() {
            Some((_, region)) => region.end() <= addr,
            None => true,
        }
    }

    /// Returns the region containing `addr`.
    pub fn find_region(&self, addr: VirtualAddress) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(addr))
    }

    /// Returns the last region of the contiguous run starting at the first region at or
    /// after `start`, i.e. the region just before the first gap.
    pub fn find_available_region(&self, start: VirtualAddress) -> Option<&Region> {
        let first = self
            .find_region(start)
            .or_else(|| self.regions.range(start..).next().map(|(_, r)| r))?;
        let mut last = first;
        for region in self.regions.range(first.end()..).map(|(_, r)| r) {
            if region.start != last.end() {
                break;
            }
            last = region;
        }
        Some(last)
    }

    /// Picks the lowest address at or above `floor` where `len` bytes fit between
    /// regions and below the top of user space.
    pub fn find_free(&self, floor: VirtualAddress, len: usize) -> VmResult<VirtualAddress> {
        let mut candidate = floor;
        for region in self.regions.values() {
            if region.end() <= candidate {
                continue;
            }
            let end = candidate.checked_add(len).ok_or(VmError::OutOfMemory)?;
            if end <= region.start {
                break;
            }
            candidate = region.end();
        }
        match candidate.checked_add(len) {
            Some(end) if end.as_usize() <= arch::USER_SPACE_TOP => Ok(candidate),
            _ => Err(VmError::OutOfMemory),
        }
    }

    /// Picks an address for a `len`-byte mapping placed by the kernel.
    ///
    /// The search starts past the run of adjacent regions beginning at the lowest region
    /// and takes the first gap that fits. With no regions at all it starts at `base`.
    pub fn find_address(&self, base: VirtualAddress, len: usize) -> VmResult<VirtualAddress> {
        let floor = match self.regions.values().next() {
            Some(lowest) => self
                .find_available_region(lowest.start)
                .map_or(lowest.start, Region::end),
            None => base,
        };
        self.find_free(floor, len)
    }

    /// Start addresses of every region overlapping `[start, end)`, in order.
    pub fn overlapping(&self, start: VirtualAddress, end: VirtualAddress) -> Vec<VirtualAddress> {
        let first = self
            .find_region(start)
            .map(|region| region.start)
            .unwrap_or(start);
        self.regions
            .range(first..end)
            .map(|(&key, _)| key)
            .collect()
    }

    /// Adds a region.
    ///
    /// # Panics
    ///
    /// Panics if the region overlaps an existing one or is empty.
    pub fn insert(&mut self, region: Region) {
        assert!(region.len != 0, "empty region");
        assert!(
            self.is_usable(region.start, region.len),
            "region at {} overlaps an existing region",
            region.start
        );
        log::debug!(
            "insert region {}..{} {:?} {:?}",
            region.start,
            region.end(),
            region.prot,
            region.flags
        );
        self.regions.insert(region.start, region);
    }

    /// Removes and returns the region starting at `start`.
    ///
    /// The region's pages are not touched; dropping it closes its file reference.
    pub fn remove(&mut self, start: VirtualAddress) -> Option<Region> {
        let region = self.regions.remove(&start)?;
        log::debug!("remove region {}..{}", region.start, region.end());
        Some(region)
    }

    /// True if `addr` lies in a `SHARED` region.
    pub fn is_shared(&self, addr: VirtualAddress) -> bool {
        self.find_region(addr).is_some_and(Region::is_shared)
    }

    /// Copies every region for a forked address space, taking a new reference on each
    /// backing file.
    pub fn duplicate(&self) -> RegionTracker {
        RegionTracker {
            regions: self.regions.clone(),
        }
    }
}
