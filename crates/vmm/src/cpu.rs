//! Per-processor translation state.

use crate::{AddressSpace, PhysicalAddress, arch};

/// The translation state of one processor.
///
/// Each core owns exactly one `CpuContext` and is the only one to switch it. Nothing here
/// is shared between cores: a directory that is dropped while still cached by another
/// core's TLB is not invalidated there.
pub struct CpuContext {
    id: usize,
    kernel_root: PhysicalAddress,
    active_root: PhysicalAddress,
}

impl CpuContext {
    /// Creates the context for processor `id`, currently running on `kernel_root`.
    pub const fn new(id: usize, kernel_root: PhysicalAddress) -> Self {
        Self {
            id,
            kernel_root,
            active_root: kernel_root,
        }
    }

    /// Index of the processor this context belongs to.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Root table currently installed on this processor.
    pub fn active_root(&self) -> PhysicalAddress {
        self.active_root
    }

    /// True if `space` is the address space this processor is running.
    pub fn is_active(&self, space: &AddressSpace) -> bool {
        self.active_root == space.root()
    }

    /// Installs `space` as this processor's translation root.
    ///
    /// Switching to the address space that is already active only flushes the TLB, which
    /// is what the fault path needs after rewriting entries.
    pub fn switch(&mut self, space: &AddressSpace) {
        self.install(space.root());
    }

    /// Returns to the kernel-only translation root, e.g. before dropping the address
    /// space that was running.
    pub fn switch_to_kernel(&mut self) {
        self.install(self.kernel_root);
    }

    fn install(&mut self, root: PhysicalAddress) {
        if root == self.active_root {
            arch::flush_all();
            return;
        }
        log::trace!("cpu {}: switch root {} -> {}", self.id, self.active_root, root);
        // SAFETY: `root` belongs to a live address space or is the kernel root.
        unsafe { arch::activate(root) };
        self.active_root = root;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn switch_tracks_active_root() {
        testing::setup(32);
        let kernel = PhysicalAddress::new(0);
        let mut cpu = CpuContext::new(0, kernel);
        let a = AddressSpace::new().unwrap();
        let b = AddressSpace::new().unwrap();

        cpu.switch(&a);
        assert!(cpu.is_active(&a));
        cpu.switch(&b);
        assert_eq!(cpu.active_root(), b.root());
        assert!(!cpu.is_active(&a));

        cpu.switch_to_kernel();
        assert_eq!(cpu.active_root(), kernel);
        assert_eq!(cpu.id(), 0);
    }

    #[test]
    fn contexts_are_independent() {
        testing::setup(32);
        let space = AddressSpace::new().unwrap();
        let mut first = CpuContext::new(0, PhysicalAddress::new(0));
        let second = CpuContext::new(1, PhysicalAddress::new(0));
        first.switch(&space);
        assert!(first.is_active(&space));
        assert!(!second.is_active(&space));
    }
}
