//! # Tracing Setup
//!
//! Configures the global `tracing` subscriber with two layers:
//!
//! - a human-readable console layer with targets and ANSI colours,
//! - a JSON layer written to a daily rotating file through a non-blocking
//!   writer, for structured analysis.
//!
//! The verbosity comes from `RUST_LOG` when set, otherwise from
//! [`LoggingOptions::level`].

use std::io;
use std::path::PathBuf;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// # Logging Options
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Directory for the rotating log files. Created when missing.
    pub log_dir: PathBuf,
    /// Prefix of the log file names (`<prefix>.YYYY-MM-DD`).
    pub file_prefix: String,
    /// Filter directive used when `RUST_LOG` is not set (e.g. "info").
    pub level: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            file_prefix: "server_unlock".to_string(),
            level: "info".to_string(),
        }
    }
}

/// Installs the global subscriber.
///
/// The returned [`WorkerGuard`] flushes the file writer when dropped, so the
/// caller has to keep it alive for as long as the process logs.
///
/// # Errors
/// Fails when the log directory cannot be created, the filter directive is
/// invalid, or a global subscriber is already installed.
pub fn setup_logging(options: &LoggingOptions) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(&options.log_dir)?;

    let file_appender = rolling::daily(&options.log_dir, &options.file_prefix);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&options.level)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    info!(
        "Logging initialized with level: {} (files in {})",
        options.level,
        options.log_dir.display()
    );
    Ok(guard)
}
