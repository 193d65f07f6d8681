//! Error types shared across the Polaris crates

use thiserror::Error;

/// Errors reported by device interfaces
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device {device} failed: {message}")]
    Communication { device: String, message: String },

    #[error("Timeout after {timeout_secs:.1}s waiting for {device} to {operation}")]
    Timeout {
        device: String,
        operation: String,
        timeout_secs: f64,
    },

    #[error("Device {device} is in the wrong state: {message}")]
    BadState { device: String, message: String },

    #[error("No image available from {0}")]
    NoImage(String),
}

impl DeviceError {
    pub fn communication(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn bad_state(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadState {
            device: device.into(),
            message: message.into(),
        }
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
