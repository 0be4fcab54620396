//! Virtual memory manager (spec.md §4.1–§4.3): physical frame allocator,
//! reference-counted mappings, and per-process address spaces.

pub mod address_space;
pub mod frame_allocator;
pub mod mapping;
pub mod page_table;
pub mod tlb;

use core::sync::atomic::{AtomicU64, Ordering};

/// Offset of the kernel's direct physical memory map: `phys_to_virt(p) =
/// p + PHYS_MEM_OFFSET`. Set once during boot from the bootstrap's memory
/// map (out of scope for this crate), mirroring the teacher's
/// `PHYS_MEM_OFFSET` convention. Frames allocated before this is set are
/// assumed to live in a fixed low-memory identity window, so `phys_to_virt`
/// is safe to call (with offset 0) even that early.
static PHYS_MEM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the kernel's physical memory map offset. Call once, early in
/// boot.
pub fn set_phys_mem_offset(offset: u64) {
    PHYS_MEM_OFFSET.store(offset, Ordering::Release);
}

/// Translate a physical address into the kernel's direct map.
pub fn phys_to_virt(phys: u64) -> u64 {
    phys + PHYS_MEM_OFFSET.load(Ordering::Acquire)
}
