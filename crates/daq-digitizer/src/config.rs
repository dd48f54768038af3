//! Per-device configuration.

use daq_core::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};

/// Static configuration of one digitizer instance.
///
/// Everything here is fixed for the lifetime of the device. Acquisition
/// settings that change between arm cycles are parameters, not configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitizerConfig {
    /// Port name, used in logs and as the default `DIGITIZER_NAME`
    #[serde(default = "default_name")]
    pub name: String,
    /// Number of data channels
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    /// Whether the hardware can capture pre-trigger samples
    #[serde(default)]
    pub supports_pre_samples: bool,
    /// Default for every channel's update-arrays switch
    #[serde(default = "default_update_arrays")]
    pub update_arrays: bool,
    /// Acquisition thread name (default: `acq:<name>`)
    #[serde(default)]
    pub thread_name: Option<String>,
    /// Maximum number of sample buffers out of the pool at once
    #[serde(default = "default_max_buffers")]
    pub max_buffers: usize,
    /// Maximum bytes of sample data out of the pool at once
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
}

fn default_name() -> String {
    "digitizer".to_string()
}

fn default_num_channels() -> usize {
    1
}

fn default_update_arrays() -> bool {
    true
}

fn default_max_buffers() -> usize {
    64
}

fn default_max_memory() -> usize {
    64 * 1024 * 1024
}

impl Default for DigitizerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            num_channels: default_num_channels(),
            supports_pre_samples: false,
            update_arrays: default_update_arrays(),
            thread_name: None,
            max_buffers: default_max_buffers(),
            max_memory: default_max_memory(),
        }
    }
}

impl DigitizerConfig {
    /// Config with `name` and `num_channels`, everything else default.
    pub fn new(name: impl Into<String>, num_channels: usize) -> Self {
        Self {
            name: name.into(),
            num_channels,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_pre_samples(mut self, supported: bool) -> Self {
        self.supports_pre_samples = supported;
        self
    }

    #[must_use]
    pub fn with_buffer_limits(mut self, max_buffers: usize, max_memory: usize) -> Self {
        self.max_buffers = max_buffers;
        self.max_memory = max_memory;
        self
    }

    #[must_use]
    pub fn with_update_arrays(mut self, update_arrays: bool) -> Self {
        self.update_arrays = update_arrays;
        self
    }

    /// Read thread name, `acq:<name>` unless configured.
    pub fn thread_name(&self) -> String {
        self.thread_name
            .clone()
            .unwrap_or_else(|| format!("acq:{}", self.name))
    }

    /// Validate configuration values that parse but make no sense.
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "digitizer name must not be empty".into(),
            ));
        }
        if self.num_channels == 0 {
            return Err(DaqError::Configuration(format!(
                "digitizer '{}' must have at least one channel",
                self.name
            )));
        }
        if self.max_buffers == 0 {
            return Err(DaqError::Configuration(format!(
                "digitizer '{}': max_buffers must be > 0",
                self.name
            )));
        }
        if self.max_memory == 0 {
            return Err(DaqError::Configuration(format!(
                "digitizer '{}': max_memory must be > 0",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: DigitizerConfig = toml::from_str("").unwrap();
        assert_eq!(config, DigitizerConfig::default());
        assert_eq!(config.thread_name(), "acq:digitizer");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: DigitizerConfig = toml::from_str(
            r#"
            name = "adc0"
            num_channels = 4
            supports_pre_samples = true
            thread_name = "reader"
            "#,
        )
        .unwrap();
        assert_eq!(config.num_channels, 4);
        assert!(config.supports_pre_samples);
        assert!(config.update_arrays);
        assert_eq!(config.thread_name(), "reader");
    }

    #[test]
    fn test_validation_rejects_zero_channels() {
        let config = DigitizerConfig::new("adc0", 0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(err.to_string().contains("at least one channel"));
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        assert!(DigitizerConfig::new("adc0", 1)
            .with_buffer_limits(0, 1)
            .validate()
            .is_err());
        assert!(DigitizerConfig::new("adc0", 1)
            .with_buffer_limits(1, 0)
            .validate()
            .is_err());
        assert!(DigitizerConfig::new(" ", 1).validate().is_err());
    }
}
