//! File logger for the coordinator.
//!
//! Lines go to `~/.hive/hive.log` as `<time> <LEVEL> <component>: <message>`,
//! where the component is the emitting module (`scheduler`, `negotiation`,
//! `scaling`, ...). The threshold comes from `--debug`, then `HIVE_LOG`
//! (`error|warn|info|debug|trace`), then `HIVE_DEBUG=1`, and defaults to INFO.
//!
//! Before [`init`] runs nothing is written, so the library and its tests
//! never touch the filesystem unless the binary opts in.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Lost work: rejected batches, dropped audit writes, crashed attempts.
    Error = 0,
    /// Recovered trouble: retries, disqualified bids, skipped scaling rules.
    Warn = 1,
    /// Run, task and scaling lifecycle.
    Info = 2,
    /// Dispatch decisions and git operations.
    Debug = 3,
    /// Raw agent output.
    Trace = 4,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN ",
            LogLevel::Info => "INFO ",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

fn resolve_level(debug_flag: bool, hive_log: Option<&str>, hive_debug: Option<&str>) -> LogLevel {
    if debug_flag {
        return LogLevel::Debug;
    }
    if let Some(level) = hive_log.and_then(|v| v.parse().ok()) {
        return level;
    }
    match hive_debug {
        Some(v) if v == "1" || v.eq_ignore_ascii_case("true") => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

/// Pick the threshold and open `~/.hive/hive.log` for appending.
pub fn init(debug: bool) {
    let level = resolve_level(
        debug,
        std::env::var("HIVE_LOG").ok().as_deref(),
        std::env::var("HIVE_DEBUG").ok().as_deref(),
    );
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    if let Some(hive_dir) = dirs::home_dir().map(|h| h.join(".hive")) {
        let _ = std::fs::create_dir_all(&hive_dir);
        LOG_PATH.set(hive_dir.join("hive.log")).ok();
    }
    log_at(
        LogLevel::Info,
        "log",
        &format!("hive {} started pid={}", env!("CARGO_PKG_VERSION"), std::process::id()),
    );
}

fn enabled(level: LogLevel) -> bool {
    level <= LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Last path segment of a module path, e.g. `hive::orchestration::scheduler` -> `scheduler`.
pub fn component(module_path: &str) -> &str {
    module_path.rsplit("::").next().unwrap_or(module_path)
}

fn format_line(level: LogLevel, target: &str, msg: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    format!("{} {} {}: {}", timestamp, level.label(), target, msg)
}

#[doc(hidden)]
pub fn log_at(level: LogLevel, target: &str, msg: &str) {
    if !enabled(level) {
        return;
    }
    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", format_line(level, target, msg));
        }
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __hive_log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log_at(
            $level,
            $crate::log::component(module_path!()),
            &format!($($arg)*),
        )
    };
}

#[macro_export]
macro_rules! hlog {
    ($($arg:tt)*) => { $crate::__hive_log!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! hlog_error {
    ($($arg:tt)*) => { $crate::__hive_log!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! hlog_warn {
    ($($arg:tt)*) => { $crate::__hive_log!($crate::log::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! hlog_debug {
    ($($arg:tt)*) => { $crate::__hive_log!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Agent stdout and other bulky payloads.
#[macro_export]
macro_rules! hlog_trace {
    ($($arg:tt)*) => { $crate::__hive_log!($crate::log::LogLevel::Trace, $($arg)*) };
}
