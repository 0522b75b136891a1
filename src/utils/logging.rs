//! Structured logging setup on top of `tracing-subscriber`.
//!
//! `RUST_LOG` takes precedence over the configured level when set.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install the global subscriber described by `config`.
///
/// # Errors
/// Returns `ProtocolError::ConfigError` if the log file cannot be opened or
/// a global subscriber is already installed
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let file = match (&config.log_to_file, &config.log_file_path) {
        (true, Some(path)) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}"))
                })?,
        ),
        _ => None,
    };

    let writer = match (config.log_to_console, file) {
        (true, Some(file)) => BoxMakeWriter::new(std::io::stdout.and(Mutex::new(file))),
        (false, Some(file)) => BoxMakeWriter::new(Mutex::new(file)),
        (_, None) => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritable_log_file() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: Some("/nonexistent-dir/reborn/protocol.log".to_string()),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(ProtocolError::ConfigError(msg)) if msg.contains("Failed to open log file")
        ));
    }

    #[test]
    fn test_second_install_rejected() {
        let config = LoggingConfig::default();
        // The first call may race with other tests; the second never succeeds.
        let _ = init_logging(&config);
        assert!(matches!(
            init_logging(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }
}
