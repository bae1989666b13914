use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

// Severity, numbered like syslog: lower is more severe. A message is emitted when its level is
// at or below the current threshold.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 3,
    Warn = 4,
    Info = 6,
    Debug = 7,
}

impl LogLevel {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0..=3 => LogLevel::Error,
            4 => LogLevel::Warn,
            5 | 6 => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn log_level() -> LogLevel {
    LogLevel::from_raw(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn is_enabled(level: LogLevel) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

// Must not be called from interrupt context: the sink takes the serial port lock.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }
    crate::serial::_print(format_args!("{} {}\n", level.tag(), args));
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}
