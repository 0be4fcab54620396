//! Boot entry point. Not part of the `anillo_kernel` library surface: this
//! binary only wires together what the bootstrap (out of scope, per spec.md
//! §6) hands in and the library crate's own `init`/`install` functions.

#![no_std]
#![no_main]

extern crate alloc;

use core::panic::PanicInfo;

use anillo_kernel::error::panic_fatal;
use anillo_kernel::sched::round_robin::RoundRobin;
use anillo_kernel::{config, logging, mm, sched, serial};

/// One entry of the physical memory map the bootstrap discovered (EFI
/// memory map or equivalent). Only `Usable` regions are handed to the frame
/// allocator; everything else is left alone rather than guessed at.
pub struct MemoryRegion {
    pub base: u64,
    pub page_count: u64,
    pub kind: MemoryRegionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    Usable,
    Reserved,
    Reclaimable,
    Mmio,
}

/// Everything the bootstrap contract (spec.md §6) hands to the core: the
/// physical memory map, the parsed `key=value` config text, the ramdisk
/// blob, and the direct-map offset the bootstrap already established.
/// Framebuffer handoff and further boot-time hardware discovery belong to
/// the bootstrap and are not represented here.
pub struct BootInfo {
    pub memory_map: &'static [MemoryRegion],
    pub config_text: &'static str,
    pub ramdisk: &'static [u8],
    pub phys_mem_offset: u64,
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    anillo_kernel::println!("[KERNEL PANIC] {}", info);
    panic_fatal("unwind reached the top-level panic handler")
}

/// Bring the core up from a bootstrap-supplied [`BootInfo`]. The actual
/// calling convention a bootstrap uses to reach this function (EFI
/// protocol, multiboot, a hand-rolled trampoline) is architecture- and
/// bootstrap-specific and out of this core's scope; this is the contract
/// the core itself expects to be called with.
#[no_mangle]
pub extern "C" fn kernel_main(boot_info: &'static BootInfo) -> ! {
    serial::init();
    anillo_kernel::println!("anillo kernel core v{}", env!("CARGO_PKG_VERSION"));

    mm::set_phys_mem_offset(boot_info.phys_mem_offset);
    for region in boot_info.memory_map {
        if region.kind == MemoryRegionKind::Usable {
            mm::frame_allocator::global().register_region(region.base, region.page_count);
        }
    }

    #[cfg(feature = "alloc")]
    let config = config::BootConfig::parse(boot_info.config_text);
    #[cfg(feature = "alloc")]
    let level = logging::level_from_cmdline(config.cmdline_value("loglevel"));
    #[cfg(not(feature = "alloc"))]
    let level = logging::level_from_cmdline(None);
    logging::init(level);

    let _ = boot_info.ramdisk;

    static SCHEDULER: RoundRobin = RoundRobin::new();
    sched::install(&SCHEDULER);

    log::info!("anillo kernel core initialized");

    // No real thread-creation backend lives in this core (spec.md §4.7
    // leaves that to the out-of-scope syscall layer); idle until a real
    // boot path registers the first thread and starts dispatching.
    loop {
        anillo_kernel::arch::drain_pending_ipi_work();
        anillo_kernel::arch::halt();
    }
}
