//! Logger collaborator
//!
//! Components receive an `Arc<dyn Logger>` at construction instead of reaching
//! for a process-wide logger. `TracingLogger` forwards to `tracing`, which is
//! what callers get unless they pass something else.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

/// Logging capability handed to each component.
///
/// Only `log` is required; the per-level methods forward to it.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>);

    fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Trace, args);
    }

    fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Debug, args);
    }

    fn info(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Info, args);
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Warn, args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Error, args);
    }

    fn fatal(&self, args: fmt::Arguments<'_>) {
        self.log(LogLevel::Fatal, args);
    }
}

/// Forwards every record to the `tracing` macros.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        match level {
            LogLevel::Trace => tracing::trace!("{}", args),
            LogLevel::Debug => tracing::debug!("{}", args),
            LogLevel::Info => tracing::info!("{}", args),
            LogLevel::Warn => tracing::warn!("{}", args),
            LogLevel::Error => tracing::error!("{}", args),
            LogLevel::Fatal => tracing::error!(fatal = true, "{}", args),
        }
    }
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: LogLevel, _args: fmt::Arguments<'_>) {}
}

/// Keeps every record in memory, for asserting on what a component logged.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far.
    pub fn records(&self) -> Vec<(LogLevel, String)> {
        self.records.lock().clone()
    }

    /// Messages logged at exactly `level`.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.messages(level).iter().any(|m| m.contains(needle))
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        self.records.lock().push((level, args.to_string()));
    }
}

/// The logger used when the caller supplies none.
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_logger_levels() {
        let logger = RecordingLogger::new();
        logger.info(format_args!("connected to {}", "localhost:6379"));
        logger.warn(format_args!("reconnecting in {}ms", 50));
        logger.error(format_args!("boom"));
        logger.fatal(format_args!("fatal boom"));

        assert_eq!(logger.records().len(), 4);
        assert!(logger.contains(LogLevel::Info, "localhost:6379"));
        assert_eq!(logger.messages(LogLevel::Warn), vec!["reconnecting in 50ms"]);
        assert_eq!(logger.messages(LogLevel::Error), vec!["boom"]);
        assert_eq!(logger.messages(LogLevel::Fatal), vec!["fatal boom"]);
    }

    #[test]
    fn test_noop_logger_is_silent() {
        let logger = NoopLogger;
        logger.error(format_args!("ignored"));
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Error < LogLevel::Fatal);
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
    }

    #[test]
    fn test_shared_logger_through_arc() {
        let recorder = Arc::new(RecordingLogger::new());
        let logger: Arc<dyn Logger> = recorder.clone();
        logger.debug(format_args!("via trait object"));
        assert!(recorder.contains(LogLevel::Debug, "trait object"));
    }
}
