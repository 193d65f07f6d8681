//! Error types for calibration and guiding

use polaris_common::DeviceError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuidingError {
    #[error("Least squares solve failed: {0}")]
    Solver(String),

    #[error("Not enough points: need {needed}, have {got}")]
    NotEnoughPoints { needed: usize, got: usize },

    #[error("Calibration is degenerate (determinant {determinant})")]
    DegenerateCalibration { determinant: f64 },

    #[error("Guider has no usable calibration")]
    Uncalibrated,

    #[error("Guide interval must be at least 1s, got {0}s")]
    InvalidInterval(f64),

    #[error("Baseline correction ({tx:.3}, {ty:.3}) exceeds the activation limit {limit:.3}")]
    ActivationOutOfRange { tx: f64, ty: f64, limit: f64 },

    #[error("Cannot parse calibration '{0}'")]
    Parse(String),

    #[error("Tracking store error: {0}")]
    Store(String),

    #[error("Guider is already tracking")]
    AlreadyRunning,

    #[error("Invalid guiding configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

pub type GuidingResult<T> = Result<T, GuidingError>;
