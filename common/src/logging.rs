//! Logging setup
//!
//! Console output through a fmt layer, optionally mirrored to a daily
//! rolling file. `RUST_LOG` overrides the configured level.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Once;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    /// Directory for rolling log files, console only when `None`
    pub log_dir: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            file_prefix: "polaris.log".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        EnvFilter::try_new(&self.level).map_err(|e| {
            ConfigError::Invalid(format!("log level {:?}: {}", self.level, e))
        })?;
        if self.log_dir.is_some() && self.file_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "file_prefix is required with log_dir".to_string(),
            ));
        }
        Ok(())
    }
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer when dropped and must be
/// kept alive for as long as logging is needed.
pub fn init_logging(
    config: &LoggingConfig,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
    }
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer().with_target(false).with_ansi(true);

    if let Some(log_dir) = &config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
        } else {
            let file_appender = tracing_appender::rolling::daily(log_dir, &config.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(non_blocking);
            let installed = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init();
            if installed.is_err() {
                eprintln!("A global tracing subscriber was already installed");
            }
            tracing::info!("Logging to {}", log_dir.display());
            return Some(guard);
        }
    }

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init()
        .is_err()
    {
        eprintln!("A global tracing subscriber was already installed");
    }
    None
}

static TEST_LOGGING: Once = Once::new();

/// Route log output through the test harness, once per process
pub fn init_test_logging() {
    TEST_LOGGING.call_once(|| {
        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}
