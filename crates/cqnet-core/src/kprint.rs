//! Kernel-style leveled logging to stderr.
//!
//! Every line is written under the stderr lock so output from concurrent
//! worker threads never interleaves mid-line. Lines carry the level and the
//! name of the emitting thread:
//!
//! ```text
//! [WARN]  cqnet-stream-2: probe failed on conn 4294967303 (errno 32)
//! ```
//!
//! # Environment Variables
//!
//! - `CQN_LOG_LEVEL=<level>` - off/error/warn/info/debug/trace or 0..=5
//! - `CQN_FLUSH_EPRINT=1` - flush stderr after every line
//!
//! # Usage
//!
//! ```ignore
//! use cqnet_core::{kinfo, kwarn};
//!
//! kinfo!("server listening on {}", addr);
//! kwarn!("accept failed: errno {}", errno);
//! ```

use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Ok(LogLevel::Off),
            "error" | "1" => Ok(LogLevel::Error),
            "warn" | "warning" | "2" => Ok(LogLevel::Warn),
            "info" | "3" => Ok(LogLevel::Info),
            "debug" | "4" => Ok(LogLevel::Debug),
            "trace" | "5" => Ok(LogLevel::Trace),
            _ => Err(()),
        }
    }
}

static ENV_LOADED: Once = Once::new();
static FLUSH: AtomicBool = AtomicBool::new(false);
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Load `CQN_LOG_LEVEL` / `CQN_FLUSH_EPRINT`.
///
/// Runs once; the first log call triggers it implicitly. Levels set with
/// [`set_log_level`] before that point are overwritten only if the
/// environment names a valid level.
pub fn init() {
    ENV_LOADED.call_once(|| {
        FLUSH.store(
            crate::env::env_get_bool("CQN_FLUSH_EPRINT", false),
            Ordering::Relaxed,
        );
        if let Some(level) = crate::env::env_get_opt::<LogLevel>("CQN_LOG_LEVEL") {
            LEVEL.store(level as u8, Ordering::Relaxed);
        }
    });
}

#[inline]
pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    init();
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    let mut out = std::io::stderr().lock();
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let current = std::thread::current();
    let who = current.name().unwrap_or("-");
    let mut out = std::io::stderr().lock();
    let _ = write!(out, "{} {}: ", level.tag(), who);
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

/// Unleveled line to stderr.
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::kprint::_kprintln_impl(format_args!(""));
    }};
    ($($arg:tt)*) => {{
        $crate::kprint::_kprintln_impl(format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Error, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Warn, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Info, format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Per-operation chatter; compiled in, filtered at runtime.
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Trace, format_args!($($arg)*));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" debug ".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert_eq!("0".parse::<LogLevel>(), Ok(LogLevel::Off));
        assert_eq!("5".parse::<LogLevel>(), Ok(LogLevel::Trace));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn test_off_disables_everything() {
        assert!(!LogLevel::Off.tag().starts_with('['));
        // Off is never "enabled", even as a message level.
        let saved = log_level();
        set_log_level(LogLevel::Trace);
        assert!(!level_enabled(LogLevel::Off));
        set_log_level(saved);
    }

    #[test]
    fn test_macros_compile() {
        kerror!("error {}", 1);
        kwarn!("warn");
        kinfo!("info {}", "x");
        kdebug!("debug");
        ktrace!("trace");
        kprintln!();
    }
}
