//! Stderr logger behind the `log` facade.
//!
//! Every crate in the workspace logs through `log::{error, warn, info,
//! debug, trace}`. Binaries and tests call [`init`] once to route those
//! records to stderr, one locked line per record.
//!
//! # Environment Variables
//!
//! - `PB_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace, or 0..5
//! - `PB_FLUSH_EPRINT=1` - flush stderr after each record

use crate::env::env_get_bool;
use log::{LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

struct StderrLogger {
    flush: AtomicBool,
}

static LOGGER: StderrLogger = StderrLogger {
    flush: AtomicBool::new(false),
};

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = writeln!(
            handle,
            "{} {}: {}",
            prefix(record.level()),
            record.target(),
            record.args()
        );
        if self.flush.load(Ordering::Relaxed) {
            let _ = handle.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn prefix(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "[ERROR]",
        log::Level::Warn => "[WARN] ",
        log::Level::Info => "[INFO] ",
        log::Level::Debug => "[DEBUG]",
        log::Level::Trace => "[TRACE]",
    }
}

/// Parse a level name or number. Unknown strings give `Info`.
pub fn parse_level(val: &str) -> LevelFilter {
    match val.trim().to_lowercase().as_str() {
        "off" | "0" => LevelFilter::Off,
        "error" | "1" => LevelFilter::Error,
        "warn" | "2" => LevelFilter::Warn,
        "info" | "3" => LevelFilter::Info,
        "debug" | "4" => LevelFilter::Debug,
        "trace" | "5" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Install the stderr logger, configured from the environment.
///
/// Safe to call more than once; only the first call installs. If another
/// logger is already registered it is left in place.
pub fn init() {
    LOGGER
        .flush
        .store(env_get_bool("PB_FLUSH_EPRINT", false), Ordering::Relaxed);
    let level = std::env::var("PB_LOG_LEVEL")
        .map(|v| parse_level(&v))
        .unwrap_or(LevelFilter::Warn);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

pub fn set_log_level(level: LevelFilter) {
    log::set_max_level(level);
}

pub fn set_flush_enabled(enabled: bool) {
    LOGGER.flush.store(enabled, Ordering::Relaxed);
}
