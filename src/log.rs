//! Structured file logging for orchestration runs.
//!
//! Log levels:
//! - ERROR: A run could not continue (malformed input, persistence failure)
//! - WARN: A task failed and was handed to recovery, or the budget ran out
//! - INFO: Run lifecycle and task transitions
//! - DEBUG: Admission decisions, gate scores, check summaries
//! - TRACE: Raw worker and check runner output
//!
//! `CONDUCTOR_DEBUG=1` raises the level to DEBUG; `CONDUCTOR_LOG=<level>`
//! picks any level. While a run is active every line carries a short run tag.
//! Nothing is written until one of the `init*` functions has been called.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{OnceLock, RwLock};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static RUN_TAG: RwLock<Option<String>> = RwLock::new(None);

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

const LEVELS: [LogLevel; 5] = [
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Info,
    LogLevel::Debug,
    LogLevel::Trace,
];

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
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LEVELS
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log level: {}", s))
    }
}

fn level_from_env() -> LogLevel {
    if let Some(level) = std::env::var("CONDUCTOR_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        return level;
    }
    let debug = std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() {
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) {
        init_at(&dir.join("conductor.log"), false);
    }
}

/// Initialize logging to an explicit file, truncating it.
///
/// The first successful call picks the file; later calls only adjust the level.
pub fn init_at(path: &Path, debug: bool) {
    let level = level_from_env().max(if debug { LogLevel::Debug } else { LogLevel::Error });
    set_level(level);

    if LOG_PATH.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, "");
    LOG_PATH.set(path.to_path_buf()).ok();
}

/// Tag subsequent lines with a run id (first 8 characters), or clear the tag.
pub fn set_run(run_id: Option<&str>) {
    if let Ok(mut tag) = RUN_TAG.write() {
        *tag = run_id.map(|id| id.chars().take(8).collect());
    }
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn get_level() -> LogLevel {
    LEVELS
        .get(LOG_LEVEL.load(Ordering::Relaxed) as usize)
        .copied()
        .unwrap_or(LogLevel::Trace)
}

fn format_line(level: LogLevel, run: Option<&str>, msg: &str) -> String {
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    match run {
        Some(run) => format!("[{}] [{}] [run {}] {}", timestamp, level.as_str(), run, msg),
        None => format!("[{}] [{}] {}", timestamp, level.as_str(), msg),
    }
}

/// Log a message at the specified level.
pub fn log_at(level: LogLevel, msg: &str) {
    if level > get_level() {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    let run = RUN_TAG.read().ok().and_then(|tag| tag.clone());
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", format_line(level, run.as_deref(), msg));
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

/// Log at INFO level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

/// Log at ERROR level.
#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

/// Log at WARN level.
#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Log at DEBUG level (only when debug mode is enabled).
#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// Log at TRACE level.
#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
