//! Architecture glue.
//!
//! Everything the core needs from hardware is named as an external
//! interface in spec.md §6: page-table-entry constructors, TLB
//! invalidation, interrupt masking, and a monotonic timestamp source. This
//! module collects those behind a small trait (`PageTableOps`) plus a
//! handful of free functions, so `mm`, `sync`, and `process` stay
//! architecture-neutral. Interrupt controller programming (LAPIC/GIC) and
//! ACPI discovery are *not* here -- they belong to the boot stub, which is
//! out of scope for this crate.

// The real per-arch backends issue privileged instructions (`cli`/`hlt`/
// `mov cr3`/`invlpg` and their aarch64 equivalents) and walk page tables
// through a direct-map offset that only a real bootstrap ever establishes.
// Selecting them by `target_arch` alone would also select them for a
// hosted `cargo test` run on an x86_64/aarch64 development machine, where
// none of that is valid. They are only ever correct under `target_os =
// "none"` (bare metal); every hosted build -- whatever its `target_arch`
// -- gets the software `generic` backend instead.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub mod x86_64;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub use self::x86_64 as current;

#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub mod aarch64;
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub use self::aarch64 as current;

#[cfg(not(all(target_os = "none", any(target_arch = "x86_64", target_arch = "aarch64"))))]
pub mod generic;
#[cfg(not(all(target_os = "none", any(target_arch = "x86_64", target_arch = "aarch64"))))]
pub use generic as current;

pub use current::Impl;

use bitflags::bitflags;

bitflags! {
    /// Permission and cacheability bits for a single page-table entry.
    ///
    /// Architecture backends translate these into their native encodings
    /// (e.g. x86_64's NX bit, ARM's AP/XN fields).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT    = 1 << 0;
        const WRITABLE   = 1 << 1;
        const USER       = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const GLOBAL     = 1 << 4;
    }
}

/// Per-architecture page table manipulation.
///
/// Implementors own a root table physical address and translate
/// [`PageFlags`] into the native encoding. All methods operate on a single
/// 4 KiB page; batching (e.g. for a mapping's portions) is the caller's
/// job, matching the "walks each portion" wording of spec.md §4.2.
pub trait PageTableOps {
    /// Create page tables rooted at a freshly allocated frame. Returns the
    /// physical address of the root table.
    fn new_root() -> KernelResult<u64>;

    /// Install a single 4 KiB mapping in the table rooted at `root`.
    ///
    /// # Safety
    /// `root` must be a currently-valid page table root physical address
    /// not concurrently mutated by another call.
    unsafe fn map_page(root: u64, virt: u64, phys: u64, flags: PageFlags) -> KernelResult<()>;

    /// Remove a single 4 KiB mapping. Returns `NoSuchResource` if nothing
    /// was mapped at `virt`.
    ///
    /// # Safety
    /// Same requirement as [`map_page`](Self::map_page).
    unsafe fn unmap_page(root: u64, virt: u64) -> KernelResult<()>;

    /// Resolve `virt` to its backing physical address, if mapped.
    ///
    /// # Safety
    /// Same requirement as [`map_page`](Self::map_page).
    unsafe fn translate(root: u64, virt: u64) -> Option<u64>;

    /// Invalidate a single TLB entry on the local CPU.
    fn flush_address(virt: u64);

    /// Invalidate the entire TLB on the local CPU (full address-space
    /// switch).
    fn flush_all();

    /// Install `root` as the table the local CPU's MMU walks, if it is not
    /// already active. Used both by `mm::address_space`'s `activate` and
    /// internally by `map_page`/`unmap_page`/`translate`, which must walk
    /// the target table through the recursive mapping before editing it.
    fn activate(root: u64);
}

use crate::error::KernelResult;

/// Halt the current CPU until the next interrupt. Used by the idle path
/// and by [`crate::error::panic_fatal`].
pub fn halt() {
    current::halt();
}

/// Mask interrupts on the local CPU, returning whether they were
/// previously enabled (so callers can restore the prior state).
pub fn disable_interrupts() -> bool {
    current::disable_interrupts()
}

/// Restore the local CPU's interrupt-enable state to `was_enabled`.
pub fn restore_interrupts(was_enabled: bool) {
    current::restore_interrupts(was_enabled);
}

/// Drain this CPU's pending cross-CPU work queue (TLB shootdown items).
///
/// Called from [`crate::sync::spinlock::IrqSpinlock`] while it spins, so
/// that a CPU holding a paging lock can never deadlock against a shootdown
/// IPI sent by a peer that is itself waiting on that same lock.
pub fn drain_pending_ipi_work() {
    current::drain_pending_ipi_work();
}

/// Enqueue a TLB shootdown item for delivery to `cpu_id` and send the IPI
/// that will cause it to drain its queue. The actual interrupt-controller
/// send is an external interface (§6); this function records the item
/// locally so `drain_pending_ipi_work` has something to act on even in
/// tests that never wire up a real controller.
pub fn send_shootdown(cpu_id: usize, virt_addr: u64) {
    current::send_shootdown(cpu_id, virt_addr);
}

/// Monotonic timestamp in an architecture-defined tick unit. External
/// interface per §6; used by timed-sleep and nothing else in this crate.
pub fn monotonic_ticks() -> u64 {
    current::monotonic_ticks()
}
