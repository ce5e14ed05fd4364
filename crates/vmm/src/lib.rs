#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
#![feature(step_trait)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager (VMM) is the per-process memory core of the Polaris
//! kernel. It provides:
//!
//! - A reference-counted physical frame allocator.
//! - Four-level page directories with fork-time copy-on-write duplication.
//! - Per-process tracking of `mmap` regions, anonymous or backed by a file.
//! - The `mmap`, `munmap`, `mremap` and `msync` system calls.
//! - A page-fault resolver for demand paging and copy-on-write.
//! - Software emulation of the MMU for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod cpu;
mod error;
mod fault;
mod file;
mod frame;
mod frame_allocator;
mod mapping;
mod numbers;
mod page_directory;
mod region;
#[cfg(any(test, feature = "software-emulation"))]
mod user_access;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, FaultCounters, ProgramLayout};
pub use cpu::CpuContext;
pub use error::{VmError, VmResult};
pub use fault::{AccessType, FaultKind, PageFault};
pub use file::{BackingFile, FileHandle};
pub use frame::{Frame, FrameFlag, FrameFlags};
pub use frame_allocator::{FrameAllocator, MemoryStats};
pub use numbers::{FrameNumber, PageNumber};
pub use page_directory::{CopyMode, DirectoryUsage, Node, PageDirectory};
pub use region::{MapFlags, Protection, Region, RegionTracker, RemapFlags, SyncFlags};

pub use arch::{MMAP_BASE, PAGE_SIZE, PageEntry, PageFlags, PageTable, USER_SPACE_TOP};
