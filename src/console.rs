//! Console output and kernel logging
//!
//! The console goes to COM1 on bare-metal x86_64 and to stderr with the
//! `std` feature. Unit tests capture it in a bounded buffer instead.
//!
//! [`KernelLogger`] routes the `log` macros to the console as
//! `[LEVEL] target: message` lines.

use core::fmt::{self, Write};
use spin::{Mutex, MutexGuard};

/// Console writer interface
pub struct Console {
    #[cfg(test)]
    buffer: heapless::String<1024>,
}

impl Console {
    /// Create a new console instance
    pub const fn new() -> Self {
        Console {
            #[cfg(test)]
            buffer: heapless::String::new(),
        }
    }

    /// Write a byte to the console
    pub fn write_byte(&mut self, byte: u8) {
        #[cfg(test)]
        {
            if byte.is_ascii() && self.buffer.push(byte as char).is_err() {
                // Full: start over rather than drop the newest output
                self.buffer.clear();
                let _ = self.buffer.push(byte as char);
            }
        }

        #[cfg(all(not(test), feature = "std"))]
        {
            use std::io::Write as _;
            let _ = std::io::stderr().write_all(&[byte]);
        }

        #[cfg(all(
            not(test),
            not(feature = "std"),
            target_arch = "x86_64",
            target_os = "none"
        ))]
        crate::arch::x86_64::serial::write_byte(byte);

        #[cfg(all(
            not(test),
            not(feature = "std"),
            not(all(target_arch = "x86_64", target_os = "none"))
        ))]
        let _ = byte;
    }

    /// Write a string to the console
    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' && cfg!(all(not(test), target_os = "none")) {
                // Serial terminals want CRLF
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }

    pub fn clear(&mut self) {
        #[cfg(test)]
        self.buffer.clear();
    }

    #[cfg(test)]
    pub fn contents(&self) -> &str {
        &self.buffer
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        Console::write_str(self, s);
        Ok(())
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// Print formatted text to console
pub fn print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Console for the panic path. A lock left held by the code the panic
/// interrupted is broken instead of waited on.
pub fn panic_console() -> MutexGuard<'static, Console> {
    if let Some(console) = CONSOLE.try_lock() {
        return console;
    }
    // SAFETY: interrupts are masked on this processor and the holder it
    // interrupted never resumes.
    unsafe { CONSOLE.force_unlock() };
    CONSOLE.lock()
}

/// Print macro for kernel use
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::print(format_args!($($arg)*));
    };
}

/// Print with newline macro
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n");
    };
    ($($arg:tt)*) => {
        $crate::console::print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

// ============================================================================
// Logging
// ============================================================================

/// `log` backend writing to the console
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

/// Format one record as a console line
pub fn write_record(w: &mut impl Write, record: &log::Record) -> fmt::Result {
    writeln!(w, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let _ = write_record(&mut *CONSOLE.lock(), record);
        }
    }

    fn flush(&self) {}
}

/// Install [`KernelLogger`] and set the level. Later calls only adjust the
/// level.
pub fn init_logging(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::debug!("console logger installed");
    }
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_captures_output() {
        let mut console = Console::new();
        write!(console, "cpu{} up", 3).unwrap();
        assert_eq!(console.contents(), "cpu3 up");

        console.clear();
        assert_eq!(console.contents(), "");
    }

    #[test]
    fn test_console_starts_over_when_full() {
        let mut console = Console::new();
        for _ in 0..1024 {
            console.write_byte(b'x');
        }
        assert_eq!(console.contents().len(), 1024);
        console.write_byte(b'y');
        assert_eq!(console.contents(), "y");
    }

    #[test]
    fn test_panic_console_breaks_held_lock() {
        let held = CONSOLE.lock();
        {
            let mut console = panic_console();
            console.write_str("report while locked");
        }
        // The broken lock is released again; forget the stale guard
        core::mem::forget(held);
        assert!(CONSOLE.lock().contents().contains("report while locked"));
    }

    #[test]
    fn test_record_format() {
        let mut out: heapless::String<128> = heapless::String::new();
        write_record(
            &mut out,
            &log::Record::builder()
                .level(log::Level::Warn)
                .target("mpkern::kern::mutex")
                .args(format_args!("{} not in wait queue", 4))
                .build(),
        )
        .unwrap();
        assert_eq!(out.as_str(), "[WARN] mpkern::kern::mutex: 4 not in wait queue\n");
    }

    #[test]
    fn test_logger_respects_level() {
        use log::Log;
        init_logging(log::LevelFilter::Info);
        let warn = log::Metadata::builder().level(log::Level::Warn).build();
        let debug = log::Metadata::builder().level(log::Level::Debug).build();
        assert!(LOGGER.enabled(&warn));
        assert!(!LOGGER.enabled(&debug));
    }
}
