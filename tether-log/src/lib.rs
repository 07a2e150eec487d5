//! Tether Logging
//!
//! Lightweight structured logging shared by the tether crates. The timer
//! dispatcher, the connection pool and the chunk decoder all log through the
//! macros exported here so a host application can control verbosity with a
//! couple of environment variables.
//!
//! # Usage
//!
//! ```rust
//! use tether_log::{debug, info, warn};
//!
//! debug!("sweeping idle streams");
//! info!("pool created for {}", "example.org:80");
//! warn!(target: "tether::timer", "timer callback panicked");
//! ```
//!
//! # Environment Variables
//!
//! - `TETHER_DEBUG=1` - Enable debug logging
//! - `TETHER_LOG_LEVEL=trace|debug|info|warn|error|off` - Minimum level
//! - `TETHER_LOG_FORMAT=pretty|compact|json` - Output format
//! - `TETHER_LOG_TIMESTAMPS=1|0` - Prefix records with a timestamp

use once_cell::sync::Lazy;
use std::env;
use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    /// Trace level (most verbose)
    Trace = 0,
    /// Debug level
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level
    Error = 4,
    /// Nothing is logged
    Off = 5,
}

impl Level {
    /// Parse a level name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Upper-case level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Level::Trace,
            1 => Level::Debug,
            2 => Level::Info,
            3 => Level::Warn,
            4 => Level::Error,
            _ => Level::Off,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Output Format
// ============================================================================

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human readable, one record per line with target in brackets
    Pretty,
    /// Single letter level, short timestamp
    Compact,
    /// One JSON object per line
    Json,
}

impl Format {
    /// Parse a format name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

// ============================================================================
// Global Configuration
// ============================================================================

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

static CONFIG: Lazy<LogConfig> = Lazy::new(LogConfig::from_env);

/// Logging configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether debug mode is enabled
    pub debug: bool,
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether to prefix records with a timestamp
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            debug: false,
            level: Level::Info,
            format: Format::Json,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Build the configuration from `TETHER_*` environment variables and
    /// publish the level to the global atomics.
    pub fn from_env() -> Self {
        let flag = |name: &str| {
            env::var(name)
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        };

        let debug = flag("TETHER_DEBUG").unwrap_or(false);

        let level = env::var("TETHER_LOG_LEVEL")
            .ok()
            .and_then(|s| Level::parse(&s))
            .unwrap_or(if debug { Level::Debug } else { Level::Info });

        let format = env::var("TETHER_LOG_FORMAT")
            .ok()
            .and_then(|s| Format::parse(&s))
            .unwrap_or(Format::Json);

        let timestamps = flag("TETHER_LOG_TIMESTAMPS").unwrap_or(true);

        DEBUG_ENABLED.store(debug, Ordering::SeqCst);
        LOG_LEVEL.store(level as u8, Ordering::SeqCst);

        Self {
            debug,
            level,
            format,
            timestamps,
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Force the lazy configuration to load.
pub fn init() {
    Lazy::force(&CONFIG);
}

/// Get the global configuration.
pub fn config() -> &'static LogConfig {
    &CONFIG
}

/// Check if debug logging is enabled.
#[inline]
pub fn is_debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Check if a log level is enabled.
#[inline]
pub fn is_level_enabled(level: Level) -> bool {
    level != Level::Off && level as u8 >= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Get current log level.
pub fn current_level() -> Level {
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level at runtime.
pub fn set_level(level: Level) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Enable or disable debug mode at runtime.
pub fn set_debug(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
    if enabled && current_level() > Level::Debug {
        set_level(Level::Debug);
    }
}

// ============================================================================
// Capture
// ============================================================================

/// A record kept by the in-memory capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Severity
    pub level: Level,
    /// Module path or explicit target
    pub target: String,
    /// Formatted message
    pub message: String,
}

static CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);

static CAPTURED: Mutex<Vec<Record>> = Mutex::new(Vec::new());

/// Start or stop keeping emitted records in memory.
///
/// Intended for tests that assert on what a background thread logged.
pub fn set_capture(enabled: bool) {
    CAPTURE_ENABLED.store(enabled, Ordering::SeqCst);
}

/// Drain the captured records.
pub fn take_captured() -> Vec<Record> {
    match CAPTURED.lock() {
        Ok(mut records) => std::mem::take(&mut *records),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

// ============================================================================
// Log Output
// ============================================================================

/// Emit a record. Called by the macros.
#[doc(hidden)]
pub fn log(level: Level, target: &str, message: &str) {
    if !is_level_enabled(level) && !(level == Level::Debug && is_debug_enabled()) {
        return;
    }

    if CAPTURE_ENABLED.load(Ordering::Relaxed)
        && let Ok(mut records) = CAPTURED.lock()
    {
        records.push(Record {
            level,
            target: target.to_string(),
            message: message.to_string(),
        });
    }

    #[cfg(feature = "tracing")]
    forward_to_tracing(level, target, message);

    let config = config();
    match config.format {
        Format::Pretty => log_pretty(level, target, message, config),
        Format::Compact => log_compact(level, target, message, config),
        Format::Json => log_json(level, target, message),
    }
}

fn log_pretty(level: Level, target: &str, message: &str, config: &LogConfig) {
    let mut stderr = std::io::stderr().lock();
    if config.timestamps {
        let now = chrono::Local::now();
        let _ = write!(stderr, "{} ", now.format("%Y-%m-%d %H:%M:%S%.3f"));
    }
    let _ = write!(stderr, "{:5} ", level.as_str());
    if !target.is_empty() {
        let _ = write!(stderr, "[{}] ", target);
    }
    let _ = writeln!(stderr, "{}", message);
}

fn log_compact(level: Level, target: &str, message: &str, config: &LogConfig) {
    let mut stderr = std::io::stderr().lock();
    if config.timestamps {
        let _ = write!(stderr, "{} ", chrono::Local::now().format("%H:%M:%S"));
    }
    let initial = level.as_str().chars().next().unwrap_or('?');
    let _ = writeln!(stderr, "{} {}: {}", initial, target, message);
}

#[cfg(feature = "json")]
fn log_json(level: Level, target: &str, message: &str) {
    use serde::Serialize;

    #[derive(Serialize)]
    struct Line<'a> {
        timestamp: String,
        level: &'a str,
        target: &'a str,
        message: &'a str,
        thread: Option<&'a str>,
    }

    let current = std::thread::current();
    let line = Line {
        timestamp: chrono::Utc::now().to_rfc3339(),
        level: level.as_str(),
        target,
        message,
        thread: current.name(),
    };

    if let Ok(json) = serde_json::to_string(&line) {
        eprintln!("{}", json);
    }
}

#[cfg(not(feature = "json"))]
fn log_json(level: Level, target: &str, message: &str) {
    let escape = |s: &str| s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n");
    eprintln!(
        r#"{{"timestamp":"{}","level":"{}","target":"{}","message":"{}"}}"#,
        chrono::Utc::now().to_rfc3339(),
        level.as_str(),
        escape(target),
        escape(message)
    );
}

#[cfg(feature = "tracing")]
fn forward_to_tracing(level: Level, target: &str, message: &str) {
    match level {
        Level::Trace => tracing::trace!(log.target = target, "{}", message),
        Level::Debug => tracing::debug!(log.target = target, "{}", message),
        Level::Info => tracing::info!(log.target = target, "{}", message),
        Level::Warn => tracing::warn!(log.target = target, "{}", message),
        Level::Error => tracing::error!(log.target = target, "{}", message),
        Level::Off => {}
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Log a trace message.
#[macro_export]
macro_rules! trace {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Trace) {
            $crate::log($crate::Level::Trace, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Trace) {
            $crate::log($crate::Level::Trace, module_path!(), &format!($($arg)+));
        }
    };
}

/// Log a debug message.
///
/// Emitted when `TETHER_DEBUG=1` or the level is `debug` or lower.
///
/// ```rust
/// use tether_log::debug;
///
/// let idle = 3;
/// debug!("moved {} streams to the old stack", idle);
/// debug!(target: "tether::pool", "sweep finished");
/// ```
#[macro_export]
macro_rules! debug {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_debug_enabled() || $crate::is_level_enabled($crate::Level::Debug) {
            $crate::log($crate::Level::Debug, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_debug_enabled() || $crate::is_level_enabled($crate::Level::Debug) {
            $crate::log($crate::Level::Debug, module_path!(), &format!($($arg)+));
        }
    };
}

/// Log an info message.
#[macro_export]
macro_rules! info {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Info) {
            $crate::log($crate::Level::Info, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Info) {
            $crate::log($crate::Level::Info, module_path!(), &format!($($arg)+));
        }
    };
}

/// Log a warning message.
#[macro_export]
macro_rules! warn {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Warn) {
            $crate::log($crate::Level::Warn, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Warn) {
            $crate::log($crate::Level::Warn, module_path!(), &format!($($arg)+));
        }
    };
}

/// Log an error message.
#[macro_export]
macro_rules! error {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Error) {
            $crate::log($crate::Level::Error, $target, &format!($($arg)+));
        }
    };
    ($($arg:tt)+) => {
        if $crate::is_level_enabled($crate::Level::Error) {
            $crate::log($crate::Level::Error, module_path!(), &format!($($arg)+));
        }
    };
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Off);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("debug"), Some(Level::Debug));
        assert_eq!(Level::parse(" WARNING "), Some(Level::Warn));
        assert_eq!(Level::parse("none"), Some(Level::Off));
        assert_eq!(Level::parse("loud"), None);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("Pretty"), Some(Format::Pretty));
        assert_eq!(Format::parse("json"), Some(Format::Json));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn test_off_is_never_enabled() {
        let original = current_level();
        set_level(Level::Trace);
        assert!(!is_level_enabled(Level::Off));
        assert!(is_level_enabled(Level::Trace));
        set_level(original);
    }

    #[test]
    fn test_capture_and_macros() {
        init();
        let original = current_level();
        set_level(Level::Trace);
        set_capture(true);

        warn!(target: "tether::test", "callback failed: {}", 7);

        set_capture(false);
        set_level(original);

        let records = take_captured();
        assert!(records.iter().any(|r| r.level == Level::Warn
            && r.target == "tether::test"
            && r.message == "callback failed: 7"));
    }
}
