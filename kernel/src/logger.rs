//! Logger initialization.
//!
//! On the real target this installs [`crate::serial::SerialLogger`] as the
//! global `log` backend. Under `cargo test` (host builds have no serial
//! port) it installs a logger that writes to stdout via `std::println!`,
//! so `log::info!`/`log::warn!` calls exercised by unit tests still work.

use conquer_once::spin::OnceCell;
use log::LevelFilter;

#[cfg(feature = "hardware")]
static LOGGER: crate::serial::SerialLogger = crate::serial::SerialLogger;

#[cfg(test)]
struct HostLogger;

#[cfg(test)]
impl log::Log for HostLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        std::println!("[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {}
}

#[cfg(test)]
static LOGGER: HostLogger = HostLogger;

/// No serial port and not under test: drop log records on the floor rather
/// than link against nothing. A real boot image always enables `hardware`.
#[cfg(not(any(feature = "hardware", test)))]
struct NullLogger;

#[cfg(not(any(feature = "hardware", test)))]
impl log::Log for NullLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        false
    }
    fn log(&self, _record: &log::Record) {}
    fn flush(&self) {}
}

#[cfg(not(any(feature = "hardware", test)))]
static LOGGER: NullLogger = NullLogger;

static INIT: OnceCell<()> = OnceCell::uninit();

pub fn init() {
    INIT.init_once(|| {
        log::set_logger(&LOGGER)
            .map(|()| log::set_max_level(LevelFilter::Trace))
            .expect("logger already initialized");
    });
}
