use std::env;
use std::io;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, prelude::*, EnvFilter};

/// Installs the global subscriber: an `EnvFilter` from `RUST_LOG` (default
/// `info`), a console layer, and a JSON layer written to a daily rolling file
/// `<LOG_DIR>/<file_prefix>` (`LOG_DIR` defaults to `logs`).
///
/// Keep the returned guard alive for as long as the process logs; dropping it
/// flushes and stops the file writer.
pub fn setup_logging(file_prefix: &str) -> io::Result<WorkerGuard> {
    let log_level: String = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let log_dir: String = env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = rolling::daily(&log_dir, file_prefix);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter: EnvFilter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&log_level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::other(e.to_string()))?;

    info!("Logging initialized with level: {}", log_level);
    Ok(guard)
}
