//! Console output.
//!
//! The board supplies a single-character output hook ([`set_output`]);
//! everything above it is portable: `kprint!`/`kprintln!` for raw
//! formatted output and a [`log`] backend for leveled messages. With no
//! hook registered, output is discarded.

use core::fmt::{self, Write};

use log::LevelFilter;
use spin::Mutex;

/// Writer over the registered character hook. Translates `\n` to `\r\n`.
struct Console {
    putc: Option<fn(u8)>,
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(putc) = self.putc {
            for byte in s.bytes() {
                if byte == b'\n' {
                    putc(b'\r');
                }
                putc(byte);
            }
        }
        Ok(())
    }
}

/// Global console writer; the mutex keeps concurrent lines intact.
static CONSOLE: Mutex<Console> = Mutex::new(Console { putc: None });

/// Register the board's character output hook (UART, SWO, ...).
pub fn set_output(putc: fn(u8)) {
    CONSOLE.lock().putc = Some(putc);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Formatted console output.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

/// Formatted console output with a trailing newline.
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

/// `log` facade backend rendering records through the console hook.
pub struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            kprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the console logger. A repeated installation (kernel re-init)
/// is a no-op.
pub fn logger_init() {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Info));
}

/// Print the startup banner.
pub fn banner() {
    kprintln!();
    kprintln!("==============================================");
    kprintln!("  Kestrel RTOS");
    kprintln!("  Version : {}", crate::config::VERSION);
    kprintln!("  Tick    : {} Hz", crate::config::TICK_HZ);
    kprintln!("==============================================");
    kprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;

    static CAPTURED: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    fn capture_putc(byte: u8) {
        CAPTURED.lock().push(byte);
    }

    #[test]
    fn test_kprintln_formats_through_hook() {
        let _guard = crate::test_util::lock();
        CAPTURED.lock().clear();
        set_output(capture_putc);

        kprintln!("tick={} name={}", 42, "idle");

        let captured = CAPTURED.lock().clone();
        let text = String::from_utf8(captured).unwrap();
        assert_eq!(text, "tick=42 name=idle\r\n");
    }

    #[test]
    fn test_banner_mentions_version() {
        let _guard = crate::test_util::lock();
        CAPTURED.lock().clear();
        set_output(capture_putc);

        banner();

        let captured = CAPTURED.lock().clone();
        let text = String::from_utf8(captured).unwrap();
        assert!(text.contains("Kestrel RTOS"));
        assert!(text.contains(crate::config::VERSION));
    }
}
