//! Kernel logging.
//!
//! Two phases: before the heap is up, messages go straight to COM1 with
//! no locks and no allocation; after [`init_logger`] runs, output fans
//! out to registered [`LogSink`]s. The `kstderr=` command line option
//! picks where the error stream goes.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use muon_core::log::LogLevel;
use muon_core::sync::SpinLock;

use crate::arch::x86::serial::{COM1, Uart16550};
use crate::cmdline::StderrRoute;

/// Maximum level actually emitted; raising it costs boot-path latency.
pub const MAX_LOG_LEVEL: LogLevel = LogLevel::Debug;

/// A dyn-compatible output sink for the kernel logger.
pub trait LogSink: Send + Sync {
    /// Writes a string fragment to this sink.
    fn write_str(&self, s: &str);
    /// Maximum level this sink accepts.
    fn max_level(&self) -> LogLevel;
}

/// A [`LogSink`] writing to a 16550 UART.
pub struct SerialSink {
    uart: Uart16550,
    max_level: LogLevel,
}

impl SerialSink {
    /// Creates a serial sink.
    pub fn new(uart: Uart16550, max_level: LogLevel) -> Self {
        Self { uart, max_level }
    }
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        self.uart.write_str(s);
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }
}

static EARLY_SERIAL: Uart16550 = Uart16550::new(COM1);
static LOGGER_READY: AtomicBool = AtomicBool::new(false);
static SINKS: SpinLock<Vec<Box<dyn LogSink>>> = SpinLock::new(Vec::new());

/// Encoded [`StderrRoute`]; default routes errors through the log.
static STDERR_ROUTE: AtomicU8 = AtomicU8::new(1);

/// Brings up the raw early-serial path. Safe to call before anything
/// else works.
pub fn init_early_serial() {
    EARLY_SERIAL.init();
}

/// Switches to the sink-based logger (requires the heap) with a serial
/// sink installed.
pub fn init_logger() {
    add_sink(Box::new(SerialSink::new(EARLY_SERIAL, MAX_LOG_LEVEL)));
    LOGGER_READY.store(true, Ordering::Release);
}

/// Registers an additional sink.
pub fn add_sink(sink: Box<dyn LogSink>) {
    SINKS.lock().push(sink);
}

/// Applies the command line's stderr routing.
pub fn route_stderr(route: StderrRoute) {
    let encoded = match route {
        StderrRoute::None => 0,
        StderrRoute::Log => 1,
        StderrRoute::Serial => 2,
    };
    STDERR_ROUTE.store(encoded, Ordering::Relaxed);
}

struct SinkFanout<'a> {
    sinks: &'a [Box<dyn LogSink>],
    level: LogLevel,
}

impl fmt::Write for SinkFanout<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for sink in self.sinks {
            if self.level <= sink.max_level() {
                sink.write_str(s);
            }
        }
        Ok(())
    }
}

/// Logger entry point used by the `k*!` macros.
pub fn write_record(level: LogLevel, args: fmt::Arguments<'_>) {
    if level > MAX_LOG_LEVEL {
        return;
    }
    if level == LogLevel::Error {
        match STDERR_ROUTE.load(Ordering::Relaxed) {
            0 => return,
            2 => {
                let mut uart = EARLY_SERIAL;
                let _ = write!(uart, "[{}] {}\n", level.tag(), args);
                return;
            }
            _ => {}
        }
    }

    if LOGGER_READY.load(Ordering::Acquire) {
        let sinks = SINKS.lock();
        let mut out = SinkFanout {
            sinks: &sinks[..],
            level,
        };
        let _ = write!(out, "[{}] {}\n", level.tag(), args);
    } else {
        let mut uart = EARLY_SERIAL;
        let _ = write!(uart, "[{}] {}\n", level.tag(), args);
    }
}

/// Logs at error level.
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::log::write_record(muon_core::log::LogLevel::Error, format_args!($($arg)*))
    };
}

/// Logs at warn level.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::log::write_record(muon_core::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

/// Logs at info level.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::log::write_record(muon_core::log::LogLevel::Info, format_args!($($arg)*))
    };
}

/// Logs at debug level.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::log::write_record(muon_core::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// Logs at trace level.
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {
        $crate::log::write_record(muon_core::log::LogLevel::Trace, format_args!($($arg)*))
    };
}
