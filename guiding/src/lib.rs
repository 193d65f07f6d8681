//! Polaris Guiding
//!
//! Calibration models and the closed-loop tracking process that keeps a
//! guide star in place by pulsing a guide port.

pub mod backlash;
pub mod calibration;
pub mod config;
pub mod driving;
pub mod error;
pub mod guider;
pub mod point;
pub mod regression;
pub mod store;
pub mod tracking;

pub use backlash::{BacklashAnalysis, BacklashDirection, BacklashPoint, BacklashResult};
pub use calibration::{BasicCalibration, CalibrationPoint, CalibrationType};
pub use config::GuidingConfig;
pub use driving::DrivingWork;
pub use error::{GuidingError, GuidingResult};
pub use guider::{GuiderDevices, GuiderProcess};
pub use point::Point;
pub use regression::{least_squares, LinearRegression};
pub use store::{GuidingRun, MemoryTrackingStore, TrackingPoint, TrackingStore};
pub use tracking::{Tracker, TrackingWork};
