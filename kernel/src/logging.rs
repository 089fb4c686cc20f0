//! `log`-crate integration over the serial console.
//!
//! Boot stages, CPU online/offline transitions and invariant violations are
//! reported through the standard [`log`] facade rather than ad-hoc
//! `println!` calls, so the execution core reads the same way the rest of
//! the kernel's services do.

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::serial_println;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        serial_println!("[{level:>5}] {}", record.args());
    }

    fn flush(&self) {}
}

/// Compile-time ceiling on emitted log levels. Overridable with the
/// `log_trace` feature for verbose scheduler debugging.
#[cfg(feature = "log_trace")]
const fn max_level() -> LevelFilter {
    LevelFilter::Trace
}

#[cfg(not(feature = "log_trace"))]
const fn max_level() -> LevelFilter {
    LevelFilter::Debug
}

/// Install the serial logger as the global `log` backend. Must be called
/// exactly once, early in boot, before any `log::*!` call.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(max_level()))
        .expect("logger already initialized");
}
