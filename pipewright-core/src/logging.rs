//! Tracing setup: human-readable stderr output plus optional JSON file logging.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LoggingConfig, default_log_dir};
use crate::error::ConfigError;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level` for the stderr layer. When
/// `config.json_file` is set, debug-level JSON logs also go to a daily rolling
/// `pipewright.log`; keep the returned guard alive to flush it.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConfigError::Invalid {
            message: format!("invalid log level '{}': {}", config.level, e),
        })?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let (json_layer, guard) = if config.json_file {
        let log_dir = config.log_dir.clone().unwrap_or_else(default_log_dir);
        std::fs::create_dir_all(&log_dir).map_err(|e| ConfigError::Invalid {
            message: format!("cannot create log directory {}: {}", log_dir.display(), e),
        })?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "pipewright.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| ConfigError::Invalid {
            message: format!("tracing already initialized: {e}"),
        })?;

    Ok(guard)
}
