//! Software fallback backend, selected for every hosted build (`cargo
//! test` and friends) regardless of the host's own `target_arch` (see
//! `arch::mod`'s cfg gating). The real per-arch backends issue privileged
//! instructions and walk page tables through a direct-map offset a real
//! bootstrap establishes; neither is available to a hosted test process,
//! so this backend models a page table as an ordinary in-memory map
//! instead, exercising the same [`PageTableOps`] contract with no unsafe
//! hardware access at all.

extern crate alloc;

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{PageFlags, PageTableOps};
use crate::error::{ErrorKind, KernelResult};
use crate::sync::Spinlock;

pub struct Generic;

/// Architecture-neutral alias used by `mm::page_table`.
pub type Impl = Generic;

static NEXT_ROOT: AtomicU64 = AtomicU64::new(1);
static TABLES: Spinlock<BTreeMap<u64, BTreeMap<u64, (u64, PageFlags)>>> =
    Spinlock::new(BTreeMap::new());

impl PageTableOps for Generic {
    fn new_root() -> KernelResult<u64> {
        let root = NEXT_ROOT.fetch_add(1, Ordering::Relaxed);
        TABLES.lock().insert(root, BTreeMap::new());
        Ok(root)
    }

    unsafe fn map_page(root: u64, virt: u64, phys: u64, flags: PageFlags) -> KernelResult<()> {
        if virt % 4096 != 0 || phys % 4096 != 0 {
            return Err(ErrorKind::InvalidArgument);
        }
        let mut tables = TABLES.lock();
        let table = tables.get_mut(&root).ok_or(ErrorKind::NoSuchResource)?;
        table.insert(virt, (phys, flags));
        Ok(())
    }

    unsafe fn unmap_page(root: u64, virt: u64) -> KernelResult<()> {
        let mut tables = TABLES.lock();
        let table = tables.get_mut(&root).ok_or(ErrorKind::NoSuchResource)?;
        table.remove(&virt).map(|_| ()).ok_or(ErrorKind::NoSuchResource)
    }

    unsafe fn translate(root: u64, virt: u64) -> Option<u64> {
        let tables = TABLES.lock();
        let table = tables.get(&root)?;
        let (phys, _) = table.get(&(virt & !0xFFF))?;
        Some(phys | (virt & 0xFFF))
    }

    fn flush_address(_virt: u64) {}

    fn flush_all() {}

    fn activate(_root: u64) {}
}

pub fn halt() {}

pub fn disable_interrupts() -> bool {
    false
}

pub fn restore_interrupts(_was_enabled: bool) {}

pub fn drain_pending_ipi_work() {}

pub fn send_shootdown(_cpu_id: usize, _virt_addr: u64) {}

static MONOTONIC: AtomicU64 = AtomicU64::new(0);

pub fn monotonic_ticks() -> u64 {
    MONOTONIC.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_translate_round_trips_the_physical_address() {
        let root = Generic::new_root().unwrap();
        // SAFETY: the generic backend has no hardware precondition.
        unsafe {
            Generic::map_page(root, 0x2000, 0x9000, PageFlags::PRESENT | PageFlags::WRITABLE).unwrap();
            assert_eq!(Generic::translate(root, 0x2000 + 0x10), Some(0x9000 + 0x10));
            Generic::unmap_page(root, 0x2000).unwrap();
            assert_eq!(Generic::translate(root, 0x2000), None);
        }
    }

    #[test]
    fn unmap_of_unmapped_page_is_no_such_resource() {
        let root = Generic::new_root().unwrap();
        // SAFETY: the generic backend has no hardware precondition.
        unsafe {
            assert_eq!(Generic::unmap_page(root, 0x3000), Err(ErrorKind::NoSuchResource));
        }
    }
}
