use crate::config::LogLevel;
use slog::{o, Drain, Level, Logger};

/// Build the root logger. All services derive their component loggers from this one via
/// `log.new(o!(..))`.
pub fn build_logger(level: LogLevel) -> Logger {
    let level = match level {
        LogLevel::Error => Level::Error,
        LogLevel::Warn => Level::Warning,
        LogLevel::Info => Level::Info,
        LogLevel::Debug => Level::Debug,
        LogLevel::Trace => Level::Trace,
    };

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).chan_size(4096).build().fuse();
    let drain = drain.filter_level(level).fuse();

    Logger::root(drain, o!())
}

/// A logger that discards everything, for tests and disabled components.
pub fn null_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}
