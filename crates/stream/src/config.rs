use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors from loading or validating a [`SpatialConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tuning for space partitioning, viewer revalidation and dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Side length of one cubic space.
    pub space_size: f32,
    /// Radius of the sphere around a viewer that decides which spaces it sees.
    pub proximity_radius: f32,
    /// Distance a viewer may move before its spaces are recomputed.
    /// Defaults to a quarter of `space_size`.
    pub hysteresis_radius: Option<f32>,
    /// How long the dispatcher waits after waking to gather more changes.
    pub batch_window_ms: u64,
    /// Pause after a failed dispatch before retrying.
    pub retry_backoff_ms: u64,
    /// Largest number of grid spaces one root is placed in. A root whose
    /// bounds span more is placed in the overflow space instead, which every
    /// viewer sees.
    pub max_root_spaces: u64,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            space_size: 32.0,
            proximity_radius: 16.0,
            hysteresis_radius: None,
            batch_window_ms: 100,
            retry_backoff_ms: 500,
            max_root_spaces: 4096,
        }
    }
}

impl SpatialConfig {
    pub fn hysteresis_radius(&self) -> f32 {
        self.hysteresis_radius.unwrap_or(self.space_size / 4.0)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.space_size.is_nan() || self.space_size <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "space_size must be positive, got {}",
                self.space_size
            )));
        }
        if self.proximity_radius.is_nan() || self.proximity_radius <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "proximity_radius must be positive, got {}",
                self.proximity_radius
            )));
        }
        if let Some(r) = self.hysteresis_radius {
            if r.is_nan() || r < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "hysteresis_radius must not be negative, got {r}"
                )));
            }
        }
        if self.max_root_spaces == 0 {
            return Err(ConfigError::Invalid(
                "max_root_spaces must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SpatialConfig::default();
        assert_eq!(config.space_size, 32.0);
        assert_eq!(config.hysteresis_radius(), 8.0);
        assert_eq!(config.batch_window(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config = SpatialConfig::from_yaml_str("space_size: 10.0\nproximity_radius: 5.0\n").unwrap();
        assert_eq!(config.space_size, 10.0);
        assert_eq!(config.hysteresis_radius(), 2.5);
        assert_eq!(config.retry_backoff_ms, 500);
        assert_eq!(config.max_root_spaces, 4096);
    }

    #[test]
    fn json_with_explicit_hysteresis() {
        let config = SpatialConfig::from_json_str(r#"{"hysteresis_radius": 1.5}"#).unwrap();
        assert_eq!(config.hysteresis_radius(), 1.5);
    }

    #[test]
    fn rejects_non_positive_space_size() {
        let err = SpatialConfig::from_yaml_str("space_size: 0.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_root_space_cap() {
        let err = SpatialConfig::from_json_str(r#"{"max_root_spaces": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
