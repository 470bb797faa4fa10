//! Logging Infrastructure
//!
//! Console logging for development, JSON for production, and optional
//! daily rotating files. `RUST_LOG` takes precedence over the level argument.

use crate::error::{ClientError, ClientResult};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize console logging
///
/// # Arguments
/// * `level` - Log level (e.g., "info", "debug", "warn")
/// * `json_format` - Whether to use JSON format
pub fn init_logger(level: &str, json_format: bool) -> ClientResult<()> {
    init_logger_with_file(level, json_format, None).map(|_| ())
}

/// Initialize logging with an optional daily rotating log file
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the lifetime of the process.
///
/// # Examples
/// ```no_run
/// # fn main() -> saffron_client::ClientResult<()> {
/// // Development setup (console only)
/// saffron_client::logger::init_logger_with_file("debug", false, None)?;
///
/// // Production setup (console + file)
/// let _guard = saffron_client::logger::init_logger_with_file("info", true, Some("./logs"))?;
/// # Ok(())
/// # }
/// ```
pub fn init_logger_with_file(
    level: &str,
    json_format: bool,
    log_dir: Option<&str>,
) -> ClientResult<Option<WorkerGuard>> {
    let console_layer = if json_format {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let dir = Path::new(dir);
            fs::create_dir_all(dir).map_err(|e| {
                ClientError::Config(format!("cannot create log dir {}: {e}", dir.display()))
            })?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "saffron");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ClientError::Config(format!("logger already initialized: {e}")))?;

    Ok(guard)
}
