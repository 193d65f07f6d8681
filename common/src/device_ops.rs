//! Device Interfaces
//!
//! The guiding loop and the task executors talk to hardware only through
//! the traits in this module. Drivers live elsewhere; the simulator module
//! provides in-process implementations.

use crate::error::DeviceResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A rectangular region of a sensor, in unbinned pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageRectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ImageRectangle {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl std::fmt::Display for ImageRectangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@({},{})", self.width, self.height, self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binning {
    pub x: u32,
    pub y: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self { x: 1, y: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Shutter {
    #[default]
    Open,
    Closed,
}

/// What an exposure is taken for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExposurePurpose {
    #[default]
    Light,
    Dark,
    Flat,
    Bias,
    Test,
    Guide,
    Focus,
}

/// Exposure request passed to a camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exposure {
    /// Exposure time in seconds
    pub exposure_time: f64,
    pub gain: f64,
    /// Region to read out, `None` for the full sensor
    pub frame: Option<ImageRectangle>,
    pub binning: Binning,
    pub shutter: Shutter,
    pub purpose: ExposurePurpose,
}

impl Default for Exposure {
    fn default() -> Self {
        Self {
            exposure_time: 1.0,
            gain: 1.0,
            frame: None,
            binning: Binning::default(),
            shutter: Shutter::Open,
            purpose: ExposurePurpose::Light,
        }
    }
}

impl Exposure {
    pub fn with_time(exposure_time: f64) -> Self {
        Self {
            exposure_time,
            ..Self::default()
        }
    }
}

/// State of a camera's exposure machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureStatus {
    Idle,
    Exposing,
    Cancelling,
    Exposed,
}

impl std::fmt::Display for ExposureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExposureStatus::Idle => "idle",
            ExposureStatus::Exposing => "exposing",
            ExposureStatus::Cancelling => "cancelling",
            ExposureStatus::Exposed => "exposed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterWheelState {
    Idle,
    Moving,
    Unknown,
}

/// Image data returned from a camera
#[derive(Debug, Clone)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
    pub exposure_secs: f64,
    pub frame: ImageRectangle,
    pub timestamp: DateTime<Utc>,
    /// Header keywords such as INSTRUME, FILTER or PROJECT
    pub metadata: BTreeMap<String, String>,
}

impl Image {
    pub fn blank(frame: ImageRectangle, exposure_secs: f64) -> Self {
        let len = frame.width as usize * frame.height as usize;
        Self {
            width: frame.width,
            height: frame.height,
            data: vec![0; len],
            exposure_secs,
            frame,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

pub type ImagePtr = Arc<Image>;

/// Camera sensor able to take exposures
pub trait Ccd: Send + Sync {
    fn name(&self) -> &str;

    fn start_exposure(&self, exposure: &Exposure) -> DeviceResult<()>;

    fn exposure_status(&self) -> DeviceResult<ExposureStatus>;

    /// Retrieve the image of the last completed exposure
    fn get_image(&self) -> DeviceResult<ImagePtr>;

    fn cancel_exposure(&self) -> DeviceResult<()>;
}

pub trait Cooler: Send + Sync {
    fn name(&self) -> &str;

    /// Set the target temperature in degrees Celsius
    fn set_temperature(&self, celsius: f64) -> DeviceResult<()>;

    fn set_on(&self, on: bool) -> DeviceResult<()>;

    /// Whether the sensor has settled at the target temperature
    fn is_stable(&self) -> DeviceResult<bool>;
}

pub trait FilterWheel: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> DeviceResult<FilterWheelState>;

    fn select(&self, filter: &str) -> DeviceResult<()>;

    fn current_filter(&self) -> DeviceResult<String>;
}

/// Actuation sink for guide pulses
///
/// Durations are seconds; per axis only one of plus/minus is nonzero.
pub trait GuidePort: Send + Sync {
    fn name(&self) -> &str;

    fn activate(&self, ra_plus: f64, ra_minus: f64, dec_plus: f64, dec_minus: f64)
        -> DeviceResult<()>;
}

pub type SharedCcd = Arc<dyn Ccd>;
pub type SharedCooler = Arc<dyn Cooler>;
pub type SharedFilterWheel = Arc<dyn FilterWheel>;
pub type SharedGuidePort = Arc<dyn GuidePort>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposure_default() {
        let exposure = Exposure::default();
        assert_eq!(exposure.exposure_time, 1.0);
        assert_eq!(exposure.binning, Binning { x: 1, y: 1 });
        assert!(exposure.frame.is_none());
    }

    #[test]
    fn test_blank_image_size() {
        let image = Image::blank(ImageRectangle::new(0, 0, 16, 8), 2.0);
        assert_eq!(image.data.len(), 128);
        assert_eq!(image.exposure_secs, 2.0);
    }

    #[test]
    fn test_rectangle_display() {
        assert_eq!(ImageRectangle::new(1, 2, 30, 40).to_string(), "30x40@(1,2)");
        assert!(ImageRectangle::default().is_empty());
    }
}
