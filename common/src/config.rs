//! JSON configuration files
//!
//! Config structs derive serde with `#[serde(default)]`, so a file only
//! needs to name the fields it overrides. A missing file yields defaults.

use crate::error::ConfigError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

pub fn load_json_config<T>(path: impl AsRef<Path>) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    let path = path.as_ref();
    if !path.exists() {
        tracing::debug!("Config {} not found, using defaults", path.display());
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

pub fn save_json_config<T: Serialize>(path: impl AsRef<Path>, config: &T) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let text = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::write(path, text).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}
