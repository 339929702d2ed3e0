//! Leveled file logging shared by the daemon and the CLI.
//!
//! Log levels:
//! - ERROR: Failures that stop an operation (merge aborted, worker failed to start)
//! - WARN: Recoverable conditions (queue backpressure, stale lock, torn journal line)
//! - INFO: Lifecycle notifications (startup, dispatch, merge, shutdown)
//! - DEBUG: Per-cycle traces of scheduling and supervision
//! - TRACE: Individual bus messages and worker stdout
//!
//! `convoy run` starts a fresh file and keeps the previous one as
//! `<name>.1`; short-lived commands append to the daemon's file. Every line
//! carries the writer's pid so the two can be told apart.
//!
//! The level comes from `--debug`, `CONVOY_DEBUG=1` or `CONVOY_LOG=<level>`.
//! Until `init` is called every record is discarded.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
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
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// How `init` treats an existing log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Keep the previous file as `<name>.1` and start empty.
    Rotate,
    /// Append to whatever is there.
    Append,
}

/// Default log location: `~/.convoy/convoy.log`.
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".convoy").join("convoy.log"))
}

/// Level requested by the flag and the environment; the most verbose wins.
pub fn requested_level(debug: bool) -> LogLevel {
    let from_debug_env = std::env::var("CONVOY_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let from_log_env = std::env::var("CONVOY_LOG")
        .ok()
        .and_then(|v| v.parse::<LogLevel>().ok());

    let base = if debug || from_debug_env {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    from_log_env.map_or(base, |level| level.max(base))
}

/// Start logging to `path` at `level`.
pub fn init(path: &Path, level: LogLevel, mode: LogMode) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if mode == LogMode::Rotate && path.exists() {
        let _ = std::fs::rename(path, rotated_path(path));
    }
    LOG_PATH.set(path.to_path_buf()).ok();
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".1");
    path.with_file_name(name)
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

fn format_line(level: LogLevel, msg: &str) -> String {
    format!(
        "[{}] [{}] [{}] {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        level.as_str(),
        std::process::id(),
        msg
    )
}

pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", format_line(level, msg));
        }
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Only written at DEBUG and above.
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
