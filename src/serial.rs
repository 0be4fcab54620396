//! Serial backend used by [`crate::print`] and [`crate::logging`].
//!
//! Grounded on the teacher's `serial.rs`: a thin per-architecture UART
//! wrapper behind a single [`crate::sync::spinlock::Spinlock`] so
//! concurrent `println!`/log calls interleave at character granularity
//! rather than corrupting each other mid-line.

use core::fmt;

use crate::sync::spinlock::Spinlock;

#[cfg(target_arch = "x86_64")]
struct Port {
    inner: uart_16550::SerialPort,
}

#[cfg(target_arch = "x86_64")]
impl Port {
    /// # Safety
    /// `base` must be the I/O port of a real, unshared 16550 UART.
    const unsafe fn new(base: u16) -> Self {
        // SAFETY: forwarded from caller.
        Self {
            inner: unsafe { uart_16550::SerialPort::new(base) },
        }
    }

    fn init(&mut self) {
        self.inner.init();
    }
}

#[cfg(target_arch = "x86_64")]
impl fmt::Write for Port {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.inner.write_str(s)
    }
}

#[cfg(target_arch = "aarch64")]
struct Port {
    base_addr: usize,
}

#[cfg(target_arch = "aarch64")]
impl Port {
    const unsafe fn new(base: usize) -> Self {
        Self { base_addr: base }
    }

    fn init(&mut self) {}
}

#[cfg(target_arch = "aarch64")]
impl fmt::Write for Port {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        const UARTDR: usize = 0x000;
        for byte in s.bytes() {
            // SAFETY: `base_addr` is the fixed PL011 MMIO base on the
            // platforms this kernel targets (QEMU `virt`); writes to the
            // data register are side-effect-free from the CPU's
            // perspective beyond transmitting a byte.
            unsafe {
                core::ptr::write_volatile((self.base_addr + UARTDR) as *mut u8, byte);
            }
        }
        Ok(())
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
struct Port;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
impl Port {
    const unsafe fn new(_base: usize) -> Self {
        Self
    }

    fn init(&mut self) {}
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
impl fmt::Write for Port {
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
const PORT_BASE: u16 = 0x3F8;
#[cfg(target_arch = "aarch64")]
const PORT_BASE: usize = 0x0900_0000;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const PORT_BASE: usize = 0;

static SERIAL: Spinlock<Port> = Spinlock::new(
    // SAFETY: `PORT_BASE` is the fixed early-boot console address for the
    // architectures this crate targets.
    unsafe { Port::new(PORT_BASE) },
);

pub fn init() {
    SERIAL.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SERIAL.lock().write_fmt(args);
}
