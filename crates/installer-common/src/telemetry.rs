//! Logging initialization
//!
//! The installer logs through `tracing`. Output goes to stderr so that
//! commands which print results (paths, phases) keep stdout clean.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed
    #[error("invalid log filter '{directive}': {message}")]
    InvalidFilter {
        /// The offending directive
        directive: String,
        /// Parser message
        message: String,
    },

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set (e.g. "info", "installer_process=debug")
    pub default_directive: String,
    /// Include the event target (module path) in each line
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "info".to_string(),
            with_target: false,
        }
    }
}

/// Build the env filter: `RUST_LOG` wins, otherwise the configured default
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.default_directive).map_err(|e| TelemetryError::InvalidFilter {
        directive: config.default_directive.clone(),
        message: e.to_string(),
    })
}

/// Install the global tracing subscriber
pub fn init_logging(config: LoggingConfig) -> Result<(), TelemetryError> {
    let filter = build_filter(&config)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(config.with_target)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_logs_at_info() {
        let config = LoggingConfig::default();
        assert_eq!(config.default_directive, "info");
        assert!(!config.with_target);
    }

    #[test]
    fn rejects_malformed_directive() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            default_directive: "installer_process=notalevel".to_string(),
            with_target: true,
        };
        let err = build_filter(&config).unwrap_err();
        assert!(err.to_string().contains("installer_process=notalevel"));
    }
}
