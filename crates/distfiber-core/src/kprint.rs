//! Kernel-style log macros for distfiber
//!
//! Thin layer over the `log` facade: every record goes to target
//! `distfiber` and is prefixed with the worker id of the emitting OS thread
//! (`[w2]`), or `[--]` on threads that are not bound to a runtime. Install
//! any `log` backend (`env_logger`, ...) to see the output.
//!
//! # Environment Variables
//!
//! - `DISTFIBER_LOG=<level>` - off, error, warn, info, debug, trace (or 0-5),
//!   applied as the `log` max level by [`init`]
//!
//! # Usage
//!
//! ```ignore
//! use distfiber_core::{kdebug, kinfo, kerror};
//!
//! kinfo!("worker {} started", id);
//! kdebug!("stole {} fibers", n);
//! kerror!("queue node missing for fiber {}", fid);
//! ```

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Log target used by every distfiber record
pub const TARGET: &str = "distfiber";

/// Log levels (same numbering as `DISTFIBER_LOG`)
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
    /// Parse a `DISTFIBER_LOG` value
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }

    /// `None` for `Off`, which never emits
    pub fn to_level(self) -> Option<log::Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(log::Level::Error),
            LogLevel::Warn => Some(log::Level::Warn),
            LogLevel::Info => Some(log::Level::Info),
            LogLevel::Debug => Some(log::Level::Debug),
            LogLevel::Trace => Some(log::Level::Trace),
        }
    }
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Apply `DISTFIBER_LOG` to the `log` max level (once)
///
/// Call after installing a logger; installing one usually resets the max level.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Some(level) = std::env::var("DISTFIBER_LOG").ok().as_deref().and_then(LogLevel::parse) {
        log::set_max_level(level.to_level_filter());
    }
}

/// Set log level programmatically
pub fn set_log_level(level: LogLevel) {
    log::set_max_level(level.to_level_filter());
}

thread_local! {
    static WORKER_TAG: Cell<u32> = const { Cell::new(u32::MAX) };
}

/// Tag records emitted from this OS thread with a worker id
pub fn set_worker_id(id: u32) {
    WORKER_TAG.with(|c| c.set(id));
}

pub fn clear_worker_id() {
    WORKER_TAG.with(|c| c.set(u32::MAX));
}

struct WorkerTag(u32);

impl fmt::Display for WorkerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == u32::MAX {
            write!(f, "[--]")
        } else {
            write!(f, "[w{}]", self.0)
        }
    }
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: fmt::Arguments<'_>) {
    let Some(level) = level.to_level() else {
        return;
    };
    if level > log::max_level() {
        return;
    }
    let tag = WorkerTag(WORKER_TAG.with(|c| c.get()));
    log::log!(target: TARGET, level, "{} {}", tag, args);
}

// ============================================================================
// Public Macros
// ============================================================================

/// Error level log
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Error,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Warn,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Info,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Debug,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::kprint::_klog_impl(
            $crate::kprint::LogLevel::Trace,
            format_args!($($arg)*)
        );
    }};
}
