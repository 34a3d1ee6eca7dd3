//! Engine Configuration System using Figment
//!
//! This module provides strongly-typed configuration loading for the run
//! engine. Configuration is layered:
//! 1. Built-in defaults
//! 2. A TOML file (`config/default.toml` unless another path is given)
//! 3. Environment variables (prefixed with `RDAQ_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore, so keys that contain a
//! single underscore stay addressable:
//!
//! ```text
//! RDAQ_APPLICATION__LOG_LEVEL=debug
//! RDAQ_STABILITY__POLL_INTERVAL=2s
//! RDAQ_ACQUISITION__RETRY__MAX_RETRIES=4
//! ```
//!
//! Recipes are not part of this configuration; they are loaded per run with
//! [`RunRecipe::load`](crate::experiment::RunRecipe::load).

use crate::error_recovery::RetryPolicy;
use crate::experiment::reduction::ReductionMethod;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub application: ApplicationConfig,
    pub stability: StabilityConfig,
    pub acquisition: AcquisitionConfig,
    pub safety: SafetyConfig,
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory for run output files
    pub data_dir: PathBuf,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "resistance_daq".to_string(),
            log_level: "info".to_string(),
            data_dir: PathBuf::from("data"),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Stability monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Delay between temperature reads
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Half-width of the band around the target, in kelvin
    pub tolerance: f64,
    /// Window length in readings. Defaults to covering `settle_timeout`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_len: Option<usize>,
    /// Consecutive failed reads before the sensor is declared unavailable
    pub max_consecutive_failures: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            tolerance: 0.1,
            window_len: None,
            max_consecutive_failures: 3,
        }
    }
}

/// Acquisition loop settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Retry policy for single reads and source commands
    pub retry: RetryPolicy,
    /// Reduction used when the recipe doesn't choose one
    pub reduction: ReductionMethod,
}

/// Safe-state handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Time allowed for the final `zero_and_disable`
    #[serde(with = "humantime_serde")]
    pub safe_state_timeout: Duration,
    /// Cryostat alarm level that aborts the run
    pub alarm_threshold: u8,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            safe_state_timeout: Duration::from_secs(2),
            alarm_threshold: 2,
        }
    }
}

/// Parameters of the simulated rig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Kelvin at startup
    pub initial_temperature: f64,
    /// First-order thermal time constant
    #[serde(with = "humantime_serde")]
    pub time_constant: Duration,
    /// Peak temperature noise in kelvin
    pub temperature_noise: f64,
    /// Sample resistance at `reference_temperature`, in ohms
    pub base_resistance: f64,
    /// Linear temperature coefficient, 1/K
    pub temperature_coefficient: f64,
    pub reference_temperature: f64,
    /// Thermoelectric voltage added to every reading
    pub thermal_offset: f64,
    /// Peak relative response noise
    pub response_noise: f64,
    #[serde(with = "humantime_serde")]
    pub read_latency: Duration,
    #[serde(with = "humantime_serde")]
    pub settling_delay: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_temperature: 295.0,
            time_constant: Duration::from_secs(20),
            temperature_noise: 0.01,
            base_resistance: 100.0,
            temperature_coefficient: 0.00385,
            reference_temperature: 273.15,
            thermal_offset: 2e-6,
            response_noise: 1e-4,
            read_latency: Duration::from_millis(20),
            settling_delay: Duration::from_millis(100),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_event_capacity() -> usize {
    1024
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl EngineConfig {
    /// Load configuration from config/default.toml and environment variables
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/default.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// Precedence (highest to lowest): `RDAQ_` environment, the file, defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("RDAQ_").split("__"))
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        if self.application.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_capacity must be > 0".to_string(),
            ));
        }

        let stability = &self.stability;
        if stability.poll_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "stability.poll_interval must be > 0".to_string(),
            ));
        }
        if !(stability.tolerance > 0.0 && stability.tolerance.is_finite()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid stability.tolerance {}",
                stability.tolerance
            )));
        }
        if stability.window_len == Some(0) {
            return Err(ConfigError::ValidationError(
                "stability.window_len must be >= 1".to_string(),
            ));
        }
        if stability.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationError(
                "stability.max_consecutive_failures must be >= 1".to_string(),
            ));
        }

        self.acquisition
            .retry
            .validate()
            .map_err(ConfigError::ValidationError)?;

        if self.safety.safe_state_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "safety.safe_state_timeout must be > 0".to_string(),
            ));
        }

        let sim = &self.simulation;
        if sim.temperature_noise < 0.0 || sim.response_noise < 0.0 {
            return Err(ConfigError::ValidationError(
                "simulation noise amplitudes must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}
