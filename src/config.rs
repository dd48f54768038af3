//! Application configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults
//! 2. A TOML file (optional; missing files are ignored)
//! 3. Environment variables prefixed with `BURST_DAQ_`, nested keys
//!    separated by `__`
//!
//! # Example
//! ```no_run
//! use burst_daq::config::AppConfig;
//!
//! // BURST_DAQ_DIGITIZER__NUM_CHANNELS=4 overrides digitizer.num_channels
//! let config = AppConfig::load_from("config/burst_daq.toml")?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::Path;
use std::time::Duration;

use daq_core::{AppResult, ArmMode, DaqError};
use daq_digitizer::DigitizerConfig;
use daq_driver_mock::SimulatedConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BURST_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub application: ApplicationConfig,
    /// Static device configuration
    pub digitizer: DigitizerConfig,
    /// Simulated hardware behavior
    pub simulator: SimulatedConfig,
    /// Settings written to the device before arming
    pub acquisition: AcquisitionConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Acquisition settings for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub mode: ArmMode,
    /// Bursts per arm cycle, 0 for unlimited
    pub num_bursts: i32,
    pub num_post_samples: i32,
    /// Total samples per burst in pre+post-trigger mode
    pub num_pre_post_samples: i32,
    /// Requested sample rate (Hz)
    pub sample_rate: f64,
    /// Inverse of the time-axis unit (1e6 for microseconds)
    pub time_unit_inv: f64,
    /// How long a run may take; unlimited runs are disarmed after this
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: ArmMode::PostTrigger,
            num_bursts: 100,
            num_post_samples: 1024,
            num_pre_post_samples: 0,
            sample_rate: 10e6,
            time_unit_inv: 1e6,
            timeout: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Load defaults, then `path`, then `BURST_DAQ_*` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(Some(path.as_ref())).extract()
    }

    /// Load defaults and environment variables only.
    pub fn load_env() -> Result<Self, figment::Error> {
        Self::figment(None).extract()
    }

    fn figment(path: Option<&Path>) -> Figment {
        let figment = Figment::new();
        let figment = match path {
            Some(path) => figment.merge(Toml::file(path)),
            None => figment,
        };
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check values that parse but make no sense together.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.digitizer.validate()?;
        self.simulator.validate()?;

        let acq = &self.acquisition;
        if !acq.sample_rate.is_finite() || acq.sample_rate <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid sample_rate {}. Must be positive",
                acq.sample_rate
            )));
        }
        if acq.num_bursts < 0 {
            return Err(DaqError::Configuration(format!(
                "Invalid num_bursts {}. Must be 0 (unlimited) or more",
                acq.num_bursts
            )));
        }
        if acq.num_post_samples < 0 {
            return Err(DaqError::Configuration(format!(
                "Invalid num_post_samples {}",
                acq.num_post_samples
            )));
        }
        match acq.mode {
            ArmMode::PostTrigger if acq.num_post_samples == 0 => {
                return Err(DaqError::Configuration(
                    "num_post_samples must be positive in post-trigger mode".into(),
                ));
            }
            ArmMode::PrePostTrigger => {
                if !self.digitizer.supports_pre_samples {
                    return Err(DaqError::Configuration(
                        "pre_post_trigger mode needs digitizer.supports_pre_samples".into(),
                    ));
                }
                if acq.num_pre_post_samples <= acq.num_post_samples {
                    return Err(DaqError::Configuration(format!(
                        "num_pre_post_samples ({}) must exceed num_post_samples ({})",
                        acq.num_pre_post_samples, acq.num_post_samples
                    )));
                }
            }
            ArmMode::PostTrigger => {}
        }
        if acq.timeout.is_zero() {
            return Err(DaqError::Configuration("timeout must be non-zero".into()));
        }
        if !acq.time_unit_inv.is_finite() || acq.time_unit_inv <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid time_unit_inv {}",
                acq.time_unit_inv
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn test_pre_post_requires_pre_sample_support() {
        let mut config = AppConfig::default();
        config.acquisition.mode = ArmMode::PrePostTrigger;
        config.acquisition.num_pre_post_samples = 2048;
        assert!(config.validate().is_err());

        config.digitizer.supports_pre_samples = true;
        assert!(config.validate().is_ok());

        config.acquisition.num_pre_post_samples = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_simulator_errors_surface() {
        let mut config = AppConfig::default();
        config.simulator.ring_capacity = 0;
        assert!(matches!(config.validate(), Err(DaqError::Driver(_))));
    }

    #[test]
    fn test_digitizer_errors_surface() {
        let mut config = AppConfig::default();
        config.digitizer.num_channels = 0;
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
    }
}
