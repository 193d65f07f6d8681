//! Task queue configuration

use crate::error::{TaskError, TaskResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts used by exposure tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureWorkConfig {
    /// Wait for the filter wheel before selecting a filter (default: 10)
    pub filterwheel_idle_timeout_secs: f64,
    /// Wait for the filter wheel to settle on the new filter (default: 30)
    pub filterwheel_settle_timeout_secs: f64,
    /// Wait for the cooler to stabilise; exceeding it only warns (default: 30)
    pub cooler_stable_timeout_secs: f64,
    /// Allowed time beyond the exposure time for the image to arrive (default: 30)
    pub exposure_grace_secs: f64,
    /// Wait for the camera to go idle after a cancel (default: 30)
    pub cancel_settle_timeout_secs: f64,
}

impl Default for ExposureWorkConfig {
    fn default() -> Self {
        Self {
            filterwheel_idle_timeout_secs: 10.0,
            filterwheel_settle_timeout_secs: 30.0,
            cooler_stable_timeout_secs: 30.0,
            exposure_grace_secs: 30.0,
            cancel_settle_timeout_secs: 30.0,
        }
    }
}

impl ExposureWorkConfig {
    /// Reject timeouts that are negative, NaN or too large for a `Duration`
    pub fn validate(&self) -> TaskResult<()> {
        let timeouts = [
            ("filterwheel_idle_timeout_secs", self.filterwheel_idle_timeout_secs),
            ("filterwheel_settle_timeout_secs", self.filterwheel_settle_timeout_secs),
            ("cooler_stable_timeout_secs", self.cooler_stable_timeout_secs),
            ("exposure_grace_secs", self.exposure_grace_secs),
            ("cancel_settle_timeout_secs", self.cancel_settle_timeout_secs),
        ];
        for (name, value) in timeouts {
            if !(value >= 0.0) || Duration::try_from_secs_f64(value).is_err() {
                return Err(TaskError::Config(format!("{} = {} out of range", name, value)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How often task work re-checks a wait condition (default: 100)
    pub poll_interval_ms: u64,
    /// Timeouts handed to the exposure work built by [`crate::TaskQueue::with_devices`]
    pub exposure: ExposureWorkConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            exposure: ExposureWorkConfig::default(),
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(TaskError::Config("poll_interval_ms must be positive".to_string()));
        }
        self.exposure.validate()
    }
}
