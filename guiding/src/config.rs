//! Guiding configuration

use crate::error::{GuidingError, GuidingResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning of a guiding session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidingConfig {
    /// Fraction of the computed correction that is applied (default: 1.0)
    pub gain: f64,
    /// Target seconds between guide exposures, at least 1 (default: 10.0)
    pub interval_secs: f64,
    /// Per axis bound on the published activation in seconds (default: 1.0)
    pub max_activation_secs: f64,
    /// Seconds between guide port activations (default: 1.0)
    pub actuation_period_secs: f64,
}

impl Default for GuidingConfig {
    fn default() -> Self {
        Self {
            gain: 1.0,
            interval_secs: 10.0,
            max_activation_secs: 1.0,
            actuation_period_secs: 1.0,
        }
    }
}

impl GuidingConfig {
    pub fn validate(&self) -> GuidingResult<()> {
        if !(self.interval_secs >= 1.0)
            || Duration::try_from_secs_f64(self.interval_secs + 1.0).is_err()
        {
            return Err(GuidingError::InvalidInterval(self.interval_secs));
        }
        if !self.gain.is_finite() || self.gain < 0.0 {
            return Err(GuidingError::Config(format!("gain {} out of range", self.gain)));
        }
        if !(self.max_activation_secs > 0.0) {
            return Err(GuidingError::Config(format!(
                "activation limit {} must be positive",
                self.max_activation_secs
            )));
        }
        if !(self.actuation_period_secs > 0.0)
            || Duration::try_from_secs_f64(self.actuation_period_secs).is_err()
        {
            return Err(GuidingError::Config(format!(
                "actuation period {} out of range",
                self.actuation_period_secs
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuidingConfig::default();
        assert_eq!(config.gain, 1.0);
        assert_eq!(config.interval_secs, 10.0);
        assert_eq!(config.max_activation_secs, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_short_interval_rejected() {
        let config = GuidingConfig {
            interval_secs: 0.5,
            ..GuidingConfig::default()
        };
        assert_eq!(config.validate(), Err(GuidingError::InvalidInterval(0.5)));
    }

    #[test]
    fn test_partial_json() {
        let config: GuidingConfig = serde_json::from_str(r#"{ "gain": 0.7 }"#).unwrap();
        assert_eq!(config.gain, 0.7);
        assert_eq!(config.interval_secs, 10.0);
    }

    #[test]
    fn test_bad_limits_rejected() {
        let config = GuidingConfig {
            max_activation_secs: 0.0,
            ..GuidingConfig::default()
        };
        assert!(matches!(config.validate(), Err(GuidingError::Config(_))));
        let config = GuidingConfig {
            gain: f64::NAN,
            ..GuidingConfig::default()
        };
        assert!(config.validate().is_err());
        let config = GuidingConfig {
            actuation_period_secs: f64::INFINITY,
            ..GuidingConfig::default()
        };
        assert!(matches!(config.validate(), Err(GuidingError::Config(_))));
        let config = GuidingConfig {
            interval_secs: 1e30,
            ..GuidingConfig::default()
        };
        assert_eq!(config.validate(), Err(GuidingError::InvalidInterval(1e30)));
    }
}
