//! Process-wide leveled logger writing text or json lines to stderr.
//!
//! Use the `log_*!` macros; they skip formatting entirely when the level is
//! disabled. Tests can turn on an in-memory capture and inspect what was
//! logged with [`take_captured`].

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        [
            ("error", Self::Error),
            ("warn", Self::Warn),
            ("warning", Self::Warn),
            ("info", Self::Info),
            ("debug", Self::Debug),
            ("trace", Self::Trace),
        ]
        .into_iter()
        .find(|(name, _)| raw.eq_ignore_ascii_case(name))
        .map(|(_, level)| level)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            4 => Self::Debug,
            _ => Self::Trace,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text,
    Json,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("text") {
            Some(Self::Text)
        } else if raw.eq_ignore_ascii_case("json") {
            Some(Self::Json)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedLine {
    pub level: Level,
    pub target: &'static str,
    pub message: String,
}

const CAPTURE_LIMIT: usize = 10_000;

static LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static JSON: AtomicBool = AtomicBool::new(false);
static TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static STDERR: AtomicBool = AtomicBool::new(true);
static CAPTURING: AtomicBool = AtomicBool::new(false);
static CAPTURED: Mutex<Vec<CapturedLine>> = Mutex::new(Vec::new());

pub fn init(config: LogConfig) {
    LEVEL.store(config.level as u8, Ordering::Relaxed);
    JSON.store(config.format == Format::Json, Ordering::Relaxed);
    TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn level() -> Level {
    Level::from_u8(LEVEL.load(Ordering::Relaxed))
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

pub fn set_stderr(enabled: bool) {
    STDERR.store(enabled, Ordering::Relaxed);
}

/// Starts or stops recording log lines in memory (bounded, oldest dropped).
pub fn capture(enabled: bool) {
    CAPTURING.store(enabled, Ordering::Relaxed);
}

/// Drains the captured lines.
pub fn take_captured() -> Vec<CapturedLine> {
    match CAPTURED.lock() {
        Ok(mut lines) => std::mem::take(&mut *lines),
        Err(_) => Vec::new(),
    }
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }
    let message = args.to_string();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    if STDERR.load(Ordering::Relaxed) {
        let rendered = if JSON.load(Ordering::Relaxed) {
            serde_json::json!({
                "ts_ms": u64::try_from(now.as_millis()).unwrap_or(u64::MAX),
                "level": level.as_str(),
                "target": target,
                "file": file,
                "line": line,
                "msg": message,
            })
            .to_string()
        } else if TIMESTAMPS.load(Ordering::Relaxed) {
            format!(
                "{} {:5} {target}: {message}",
                utc_timestamp(now.as_secs(), now.subsec_millis()),
                level.as_str()
            )
        } else {
            format!("{:5} {target}: {message}", level.as_str())
        };
        let _ = writeln!(std::io::stderr().lock(), "{rendered}");
    }

    if CAPTURING.load(Ordering::Relaxed) {
        if let Ok(mut lines) = CAPTURED.lock() {
            if lines.len() >= CAPTURE_LIMIT {
                lines.remove(0);
            }
            lines.push(CapturedLine {
                level,
                target,
                message,
            });
        }
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => { $crate::log_at!($crate::Level::Trace, $($arg)*) };
}

fn utc_timestamp(unix_seconds: u64, millis: u32) -> String {
    let mut days = unix_seconds / 86_400;
    let secs = unix_seconds % 86_400;
    let mut year = 1970u64;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if days < year_days {
            break;
        }
        days -= year_days;
        year += 1;
    }
    let month_days = [
        31,
        if is_leap(year) { 29 } else { 28 },
        31,
        30,
        31,
        30,
        31,
        31,
        30,
        31,
        30,
        31,
    ];
    let mut month = 1;
    for length in month_days {
        if days < length {
            break;
        }
        days -= length;
        month += 1;
    }
    format!(
        "{year:04}-{month:02}-{:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        days + 1,
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

fn is_leap(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse(" WARN "), Some(Level::Warn));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("nope"), None);
    }

    #[test]
    fn parse_format() {
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("text"), Some(Format::Text));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn timestamps_are_utc_calendar_dates() {
        assert_eq!(utc_timestamp(0, 0), "1970-01-01T00:00:00.000Z");
        assert_eq!(utc_timestamp(951_782_400, 5), "2000-02-29T00:00:00.005Z");
        assert_eq!(utc_timestamp(1_231_006_505, 0), "2009-01-03T18:15:05.000Z");
    }
}
