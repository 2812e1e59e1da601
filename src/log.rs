//! File logging for the coordinator and its workers.
//!
//! One log file per process under `~/.maestro/`: the coordinator writes
//! `maestro.log`, each worker writes `worker-<name>.log`. Files are truncated
//! when the process starts. Until [`init_with_debug`] or [`init_worker`] runs,
//! every macro is a no-op, which keeps library callers and tests quiet.
//!
//! `--debug` or `MAESTRO_DEBUG=1` lowers the threshold to DEBUG.
//! `MAESTRO_LOG=<level>` sets it explicitly and wins over both.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

static SINK: OnceLock<Sink> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    const ALL: [Level; 5] = [
        Level::Error,
        Level::Warn,
        Level::Info,
        Level::Debug,
        Level::Trace,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Level::ALL
            .into_iter()
            .find(|l| l.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log level: {}", s))
    }
}

struct Sink {
    path: PathBuf,
    /// Prefix on every line: "coord" or the worker name.
    origin: String,
    file: Mutex<File>,
}

/// Coordinator logging to `~/.maestro/maestro.log`.
pub fn init_with_debug(debug: bool) {
    open("maestro.log", "coord", debug);
}

/// Worker logging to `~/.maestro/worker-<name>.log`.
pub fn init_worker(name: &str, debug: bool) {
    open(&format!("worker-{}.log", file_safe(name)), name, debug);
}

fn open(file_name: &str, origin: &str, debug: bool) {
    set_threshold(threshold_from_env(
        debug,
        std::env::var("MAESTRO_DEBUG").ok().as_deref(),
        std::env::var("MAESTRO_LOG").ok().as_deref(),
    ));

    let Some(dir) = dirs::home_dir().map(|h| h.join(".maestro")) else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let path = dir.join(file_name);
    if let Ok(file) = File::create(&path) {
        let _ = SINK.set(Sink {
            path,
            origin: origin.to_string(),
            file: Mutex::new(file),
        });
    }
}

fn threshold_from_env(debug: bool, debug_var: Option<&str>, level_var: Option<&str>) -> Level {
    if let Some(level) = level_var.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = matches!(debug_var, Some(v) if v == "1" || v.eq_ignore_ascii_case("true"));
    if debug || env_debug {
        Level::Debug
    } else {
        Level::Info
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn set_threshold(level: Level) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

fn enabled(level: Level) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

/// Where this process is logging, once initialized.
pub fn path() -> Option<&'static Path> {
    SINK.get().map(|s| s.path.as_path())
}

fn render(time: impl fmt::Display, level: Level, origin: &str, args: fmt::Arguments<'_>) -> String {
    format!("[{}] {:<5} {}: {}", time, level.label(), origin, args)
}

#[doc(hidden)]
pub fn write(level: Level, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let Some(sink) = SINK.get() else {
        return;
    };
    let now = chrono::Local::now().format("%H:%M:%S%.3f");
    let line = render(now, level, &sink.origin, args);
    if let Ok(mut file) = sink.file.lock() {
        let _ = writeln!(file, "{}", line);
    }
}

#[macro_export]
macro_rules! mlog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_debug {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Debug, format_args!($($arg)*))
    };
}

/// Wire frames and agent stream events. Only with `MAESTRO_LOG=trace`.
#[macro_export]
macro_rules! mlog_trace {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Trace, format_args!($($arg)*))
    };
}
