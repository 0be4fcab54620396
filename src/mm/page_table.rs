//! Glue between [`crate::mm`]'s virtual-address-space model and the
//! per-architecture [`crate::arch::PageTableOps`] backend.

use crate::arch::{Impl as ArchImpl, PageFlags, PageTableOps};
use crate::error::KernelResult;

/// A single process's (or the kernel's) root page table.
pub struct PageTable {
    root: u64,
}

impl PageTable {
    /// Allocate a fresh, empty root table.
    pub fn new() -> KernelResult<Self> {
        Ok(Self {
            root: ArchImpl::new_root()?,
        })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// # Safety
    /// No other thread may be concurrently mutating this table.
    pub unsafe fn map(&self, virt: u64, phys: u64, flags: PageFlags) -> KernelResult<()> {
        // SAFETY: forwarded from the caller's contract.
        unsafe { ArchImpl::map_page(self.root, virt, phys, flags) }
    }

    /// # Safety
    /// No other thread may be concurrently mutating this table.
    pub unsafe fn unmap(&self, virt: u64) -> KernelResult<()> {
        // SAFETY: forwarded from the caller's contract.
        unsafe { ArchImpl::unmap_page(self.root, virt) }
    }

    /// # Safety
    /// No other thread may be concurrently mutating this table.
    pub unsafe fn translate(&self, virt: u64) -> Option<u64> {
        // SAFETY: forwarded from the caller's contract.
        unsafe { ArchImpl::translate(self.root, virt) }
    }

    pub fn flush_address(&self, virt: u64) {
        ArchImpl::flush_address(virt);
    }

    pub fn flush_all(&self) {
        ArchImpl::flush_all();
    }

    /// Install this table as the one the local CPU's MMU walks. Called by
    /// [`crate::mm::address_space::AddressSpace::activate`] on a context
    /// switch into the owning process.
    pub fn activate(&self) {
        ArchImpl::activate(self.root);
    }
}
