//! Polaris Common
//!
//! Shared building blocks for the guiding, task and processing crates:
//! device interfaces, cooperative cancellation, logging setup and
//! configuration loading.

pub mod cancel;
pub mod config;
pub mod device_name;
pub mod device_ops;
pub mod error;
pub mod logging;
pub mod simulator;

pub use cancel::CancellationToken;
pub use config::{load_json_config, save_json_config};
pub use device_name::DeviceName;
pub use device_ops::*;
pub use error::{ConfigError, DeviceError, DeviceResult};
