/// Macros that format a record and hand it to a `Logger` at a fixed level.
///
/// # Usage
/// ```ignore
/// log_info!(self.logger, "connected to {}", endpoint);
/// log_warn!(self.logger, "reconnecting in {:?}", delay);
/// ```
#[macro_export]
macro_rules! log_at {
    ($logger:expr, $level:ident, $($arg:tt)+) => {
        {
            use $crate::logger::Logger as _;
            $logger.log($crate::logger::LogLevel::$level, format_args!($($arg)+))
        }
    };
}

#[macro_export]
macro_rules! log_trace {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_at!($logger, Trace, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_at!($logger, Debug, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_at!($logger, Info, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_at!($logger, Warn, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_at!($logger, Error, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_fatal {
    ($logger:expr, $($arg:tt)+) => {
        $crate::log_at!($logger, Fatal, $($arg)+)
    };
}
