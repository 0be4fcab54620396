//! `log` backend writing to the serial console.
//!
//! Mirrors the teacher's `println!`/`serial_println!` split (one macro per
//! destination) by instead giving every subsystem a single `log` front end
//! and letting the *backend* decide where bytes go -- today that is always
//! the serial port, but callers never need to know that.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::println!("[{:5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger and set the level. Idempotent: a second call
/// is a no-op `log::SetLoggerError`, which is not fatal here since tests
/// may call `init` more than once.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Parse a `cmdline` level token (`off|error|warn|info|debug|trace`),
/// defaulting to `Info` on anything unrecognized rather than failing boot
/// over a log-level typo.
pub fn level_from_cmdline(token: Option<&str>) -> LevelFilter {
    match token {
        Some("off") => LevelFilter::Off,
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}
