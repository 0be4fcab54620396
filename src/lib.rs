//! Anillo OS kernel core: virtual memory, synchronization, channels, and
//! process/descriptor management (spec.md §1–§2).
//!
//! This crate is the architecture-neutral core invoked by the boot path;
//! it owns no boot protocol, driver, or filesystem code of its own.

#![no_std]
#![cfg_attr(not(test), allow(dead_code))]
#![cfg_attr(all(feature = "alloc", target_os = "none"), feature(alloc_error_handler))]

#[cfg(feature = "alloc")]
extern crate alloc;

// Bare-metal targets get the real heap allocator backing every `Vec`/`Arc`
// in this crate; hosted `cargo test` runs delegate to the system allocator
// so unit tests can allocate normally without bringing up a real heap.
#[cfg(all(feature = "alloc", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(feature = "alloc", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(all(feature = "alloc", target_os = "none"))]
/// Initialize the kernel heap over `[start, start + size)`. Call once,
/// early in boot, before any subsystem allocates.
///
/// # Safety
/// `start..start + size` must be unused, mapped, writable memory for the
/// remainder of the kernel's lifetime.
pub unsafe fn init_heap(start: usize, size: usize) {
    // SAFETY: forwarded from the caller's contract.
    unsafe { ALLOCATOR.lock().init(start as *mut u8, size) };
}

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod mm;
pub mod process;
pub mod raii;
pub mod sched;
pub mod serial;
pub mod sync;

/// Heap allocation failure in a `no_std` kernel is unrecoverable (spec.md
/// §7: "Memory allocation failure is always `temporary_outage`" for
/// *callers*, but the global allocator itself has no caller to return to).
#[cfg(all(feature = "alloc", target_os = "none"))]
#[alloc_error_handler]
fn alloc_error_handler(_layout: core::alloc::Layout) -> ! {
    error::panic_fatal("heap allocation failed")
}
