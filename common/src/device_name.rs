//! Device names
//!
//! Devices are addressed as `type:module/unit[/component...]`, for example
//! `ccd:sx/001/Imaging` or `cooler:sx/001/Imaging`. Everything addressed
//! through the same module and unit is one piece of hardware.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceName {
    pub kind: String,
    pub module: String,
    pub unit: String,
    pub components: Vec<String>,
}

impl DeviceName {
    /// The hardware a device lives on, as `(module, unit)`
    pub fn physical(&self) -> (&str, &str) {
        (&self.module, &self.unit)
    }

    pub fn same_hardware(&self, other: &DeviceName) -> bool {
        self.physical() == other.physical()
    }
}

impl FromStr for DeviceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, path) = s
            .split_once(':')
            .ok_or_else(|| format!("device name '{}' has no type prefix", s))?;
        let mut parts = path.split('/');
        let module = parts.next().unwrap_or_default();
        let unit = parts.next().unwrap_or_default();
        if kind.is_empty() || module.is_empty() || unit.is_empty() {
            return Err(format!("device name '{}' is incomplete", s));
        }
        Ok(Self {
            kind: kind.to_string(),
            module: module.to_string(),
            unit: unit.to_string(),
            components: parts.map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.module, self.unit)?;
        for component in &self.components {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

/// Whether two device name strings refer to the same hardware
///
/// Empty names never match. Names that do not parse compare literally.
pub fn same_device(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    match (a.parse::<DeviceName>(), b.parse::<DeviceName>()) {
        (Ok(x), Ok(y)) => x.same_hardware(&y),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_name() {
        let name: DeviceName = "ccd:sx/001/Imaging".parse().unwrap();
        assert_eq!(name.kind, "ccd");
        assert_eq!(name.module, "sx");
        assert_eq!(name.unit, "001");
        assert_eq!(name.components, vec!["Imaging".to_string()]);
        assert_eq!(name.to_string(), "ccd:sx/001/Imaging");
    }

    #[test]
    fn test_parse_rejects_incomplete() {
        assert!("sx/001".parse::<DeviceName>().is_err());
        assert!("ccd:sx".parse::<DeviceName>().is_err());
        assert!(":sx/001".parse::<DeviceName>().is_err());
    }

    #[test]
    fn test_same_device_by_hardware() {
        assert!(same_device("ccd:sx/001/Imaging", "cooler:sx/001/Imaging"));
        assert!(same_device("ccd:sx/001/Imaging", "ccd:sx/001/Guider"));
        assert!(!same_device("ccd:sx/001/Imaging", "ccd:sx/002/Imaging"));
        assert!(!same_device("ccd:sx/001/Imaging", "ccd:qhy/001/Imaging"));
    }

    #[test]
    fn test_same_device_fallbacks() {
        assert!(!same_device("", ""));
        assert!(!same_device("", "mount:eq/1"));
        assert!(same_device("Main Mount", "Main Mount"));
        assert!(!same_device("Main Mount", "mount:eq/1"));
    }
}
