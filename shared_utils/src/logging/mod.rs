//! Logging setup shared by the broker daemon and `neonctl`.
//!
//! The daemon logs to stdout and, when configured, to a daily rolling file.
//! `neonctl` logs to stderr so its command output stays parseable.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;

/// Prefix of the rolling log files; the appender adds the date.
pub const LOG_FILE_PREFIX: &str = "neon_broker.log";

/// Stream that receives console output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Console {
    #[default]
    Stdout,
    Stderr,
}

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: Level,
    pub console: Console,
    /// Also write daily rolling files into this directory
    pub log_dir: Option<PathBuf>,
    pub json_format: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            console: Console::Stdout,
            log_dir: None,
            json_format: false,
        }
    }
}

/// Parse a textual level, falling back to INFO for anything unrecognised.
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` directives are honoured on top of `options.level`. The returned
/// guard flushes the file writer on drop and must live as long as the
/// program. Calling this twice in one process keeps the first subscriber.
///
/// ```
/// use shared_utils::logging::{init_logging, Console, LogOptions};
/// use tracing::Level;
///
/// let _guard = init_logging(LogOptions {
///     level: Level::DEBUG,
///     console: Console::Stderr,
///     ..Default::default()
/// });
/// ```
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    let _ = LogTracer::init();

    let filter = EnvFilter::from_default_env().add_directive(options.level.into());

    let console = fmt::layer().with_target(true);
    let console = match (options.console, options.json_format) {
        (Console::Stdout, false) => console.boxed(),
        (Console::Stdout, true) => console.json().boxed(),
        (Console::Stderr, false) => console.with_writer(std::io::stderr).boxed(),
        (Console::Stderr, true) => console.with_writer(std::io::stderr).json().boxed(),
    };
    let mut layers = vec![console];

    let mut guard = None;
    if let Some(dir) = &options.log_dir {
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
        let (writer, worker_guard) = NonBlocking::new(appender);
        guard = Some(worker_guard);

        let file = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer);
        layers.push(if options.json_format {
            file.json().boxed()
        } else {
            file.boxed()
        });
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    guard
}

/// Build [`LogOptions`] from `log_level` and the `[logging]` table.
pub fn options_from_config(config: &Config) -> LogOptions {
    LogOptions {
        level: parse_level(&config.log_level),
        log_dir: config
            .logging
            .log_to_file
            .then(|| PathBuf::from(&config.logging.log_dir)),
        json_format: config.logging.json_format,
        ..Default::default()
    }
}

pub fn init_logging_from_config(config: &Config) -> Option<WorkerGuard> {
    init_logging(options_from_config(config))
}
