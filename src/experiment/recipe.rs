//! Run recipes: the ordered setpoint list a run executes.
//!
//! A [`RunRecipe`] is plain data. It is built in code with the `with_*`
//! builders or loaded from a TOML or JSON file, validated once at
//! [`RunEngine::start`](super::RunEngine::start), and never mutated by the
//! engine afterwards.
//!
//! ```toml
//! name = "NbSe2 cooldown"
//!
//! [safety]
//! max_safe_temperature = 320.0
//! max_safe_excitation = 1e-3
//!
//! [[setpoints]]
//! target_temperature = 10.0
//! settle_timeout = "30s"
//! max_settle_wait = "10m"
//! sample_interval = "500ms"
//! source_values = [1e-3]
//! ```
//!
//! Sweeps are usually written as a short list of [`RampStage`]s and expanded
//! into setpoints with [`RampProgram::expand`].

use crate::experiment::reduction::ReductionMethod;
use crate::metadata::Metadata;
use crate::error::SafetyViolation;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Setpoints
// =============================================================================

/// One temperature setpoint and what to measure once it has settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetpointSpec {
    /// Target temperature in kelvin.
    pub target_temperature: f64,
    /// Length of the window the temperature must stay in band.
    #[serde(with = "humantime_serde")]
    pub settle_timeout: Duration,
    /// Give up waiting for stability after this long.
    #[serde(with = "humantime_serde")]
    pub max_settle_wait: Duration,
    /// Readings averaged into each sample.
    #[serde(default = "default_samples_per_point")]
    pub samples_per_point: u32,
    /// Delay between consecutive readings of one excitation step.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// Excitation levels, measured in order. One sample per value.
    pub source_values: Vec<f64>,
    /// Controller ramp rate in K/min, for controllers that ramp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_rate: Option<f64>,
    /// Overrides the configured stability band for this setpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    /// Settle before measuring, or measure while sweeping.
    #[serde(default)]
    pub mode: SetpointMode,
}

/// How a setpoint is measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetpointMode {
    /// Wait for stability, then measure every excitation once.
    #[default]
    Settle,
    /// Command the target and measure continuously, one pass over the
    /// excitations every `sample_interval`, until the temperature arrives in
    /// the tolerance band.
    Sweep,
}

fn default_samples_per_point() -> u32 {
    1
}

impl SetpointSpec {
    /// A setpoint with one reading per excitation and a 1 s sample interval.
    pub fn new(target_temperature: f64, settle_timeout: Duration, max_settle_wait: Duration) -> Self {
        Self {
            target_temperature,
            settle_timeout,
            max_settle_wait,
            samples_per_point: default_samples_per_point(),
            sample_interval: Duration::from_secs(1),
            source_values: Vec::new(),
            ramp_rate: None,
            tolerance: None,
            mode: SetpointMode::Settle,
        }
    }

    pub fn with_source_values(mut self, values: &[f64]) -> Self {
        self.source_values = values.to_vec();
        self
    }

    pub fn with_samples(mut self, samples_per_point: u32, sample_interval: Duration) -> Self {
        self.samples_per_point = samples_per_point;
        self.sample_interval = sample_interval;
        self
    }

    pub fn with_ramp_rate(mut self, kelvin_per_minute: f64) -> Self {
        self.ramp_rate = Some(kelvin_per_minute);
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Measures continuously while the temperature moves to the target.
    pub fn sweeping(mut self) -> Self {
        self.mode = SetpointMode::Sweep;
        self
    }
}

// =============================================================================
// Policies and limits
// =============================================================================

/// What to do when a setpoint never settles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    #[default]
    Abort,
    /// Measure anyway; samples are flagged `Degraded`.
    ProceedAnyway,
    Skip,
}

/// What to do when an excitation step exhausts its read retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AcquisitionErrorPolicy {
    AbortRun,
    SkipSetpoint,
    /// Re-run the whole setpoint, then skip it once retries are used up.
    RetrySetpoint { max_retries: u32 },
}

impl Default for AcquisitionErrorPolicy {
    fn default() -> Self {
        AcquisitionErrorPolicy::RetrySetpoint { max_retries: 1 }
    }
}

/// Failure handling for a recipe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPolicy {
    pub on_timeout: TimeoutPolicy,
    pub on_acquisition_error: AcquisitionErrorPolicy,
}

/// Absolute hard limits. A reading past any of these aborts the run.
///
/// Limits missing from a recipe file take their default values; none of them
/// can be switched off.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Kelvin.
    pub max_safe_temperature: f64,
    /// Largest excitation magnitude, commanded or sensed (A).
    pub max_safe_excitation: f64,
    /// Largest response magnitude (V), usually the compliance voltage.
    pub max_safe_response: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_safe_temperature: 320.0,
            max_safe_excitation: 1e-3,
            max_safe_response: 21.0,
        }
    }
}

// NaN readings fail every check.
impl SafetyLimits {
    pub fn check_temperature(&self, measured: f64) -> Result<(), SafetyViolation> {
        if measured <= self.max_safe_temperature {
            Ok(())
        } else {
            Err(SafetyViolation::Temperature {
                measured,
                limit: self.max_safe_temperature,
            })
        }
    }

    pub fn check_excitation(&self, value: f64) -> Result<(), SafetyViolation> {
        if value.abs() <= self.max_safe_excitation {
            Ok(())
        } else {
            Err(SafetyViolation::Excitation {
                value,
                limit: self.max_safe_excitation,
            })
        }
    }

    pub fn check_response(&self, measured: f64) -> Result<(), SafetyViolation> {
        if measured.abs() <= self.max_safe_response {
            Ok(())
        } else {
            Err(SafetyViolation::Response {
                measured,
                limit: self.max_safe_response,
            })
        }
    }
}

// =============================================================================
// Recipe
// =============================================================================

/// An ordered list of setpoints plus everything needed to run them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecipe {
    pub name: String,
    /// Overrides the engine's configured reduction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduction: Option<ReductionMethod>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub safety: SafetyLimits,
    #[serde(default)]
    pub policy: RunPolicy,
    pub setpoints: Vec<SetpointSpec>,
}

impl RunRecipe {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reduction: None,
            metadata: Metadata::default(),
            safety: SafetyLimits::default(),
            policy: RunPolicy::default(),
            setpoints: Vec::new(),
        }
    }

    pub fn with_setpoint(mut self, setpoint: SetpointSpec) -> Self {
        self.setpoints.push(setpoint);
        self
    }

    pub fn with_safety(mut self, safety: SafetyLimits) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_policy(mut self, policy: RunPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_reduction(mut self, reduction: ReductionMethod) -> Self {
        self.reduction = Some(reduction);
        self
    }

    /// Total number of samples an error-free run produces. Sweep setpoints
    /// count one pass; they add a pass per `sample_interval` until arrival.
    pub fn expected_samples(&self) -> usize {
        self.setpoints.iter().map(|s| s.source_values.len()).sum()
    }

    /// Checks the recipe before a run starts.
    ///
    /// Target order is not checked: sweeps and arbitrary point lists are both
    /// valid.
    pub fn validate(&self) -> Result<(), String> {
        let limits = &self.safety;
        if !(limits.max_safe_temperature.is_finite() && limits.max_safe_temperature > 0.0) {
            return Err("max_safe_temperature must be a positive number".to_string());
        }
        if !(limits.max_safe_excitation.is_finite() && limits.max_safe_excitation > 0.0) {
            return Err("max_safe_excitation must be a positive number".to_string());
        }
        if !(limits.max_safe_response.is_finite() && limits.max_safe_response > 0.0) {
            return Err("max_safe_response must be a positive number".to_string());
        }
        if self.setpoints.is_empty() {
            return Err("recipe has no setpoints".to_string());
        }

        for (index, setpoint) in self.setpoints.iter().enumerate() {
            validate_setpoint(setpoint, limits).map_err(|e| format!("setpoint {index}: {e}"))?;
        }
        Ok(())
    }

    /// Loads a recipe, choosing the format from the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe {}", path.display()))?;
        let recipe = match extension(path).as_deref() {
            Some("toml") => toml::from_str(&text)
                .with_context(|| format!("Failed to parse TOML recipe {}", path.display()))?,
            Some("json") => serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse JSON recipe {}", path.display()))?,
            _ => bail!("Unsupported recipe format: {}", path.display()),
        };
        Ok(recipe)
    }

    /// Saves the recipe, choosing the format from the file extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = match extension(path).as_deref() {
            Some("toml") => toml::to_string_pretty(self).context("Failed to serialize recipe")?,
            Some("json") => {
                serde_json::to_string_pretty(self).context("Failed to serialize recipe")?
            }
            _ => bail!("Unsupported recipe format: {}", path.display()),
        };
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write recipe {}", path.display()))
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn validate_setpoint(setpoint: &SetpointSpec, limits: &SafetyLimits) -> Result<(), String> {
    let target = setpoint.target_temperature;
    if !target.is_finite() || target < 0.0 {
        return Err(format!("invalid target temperature {target}"));
    }
    if target > limits.max_safe_temperature {
        return Err(format!(
            "target {target} K exceeds max_safe_temperature {} K",
            limits.max_safe_temperature
        ));
    }
    if setpoint.settle_timeout.is_zero() {
        return Err("settle_timeout must be > 0".to_string());
    }
    if setpoint.max_settle_wait.is_zero() {
        return Err("max_settle_wait must be > 0".to_string());
    }
    if setpoint.sample_interval.is_zero() {
        return Err("sample_interval must be > 0".to_string());
    }
    if setpoint.samples_per_point == 0 {
        return Err("samples_per_point must be >= 1".to_string());
    }
    if setpoint.source_values.is_empty() {
        return Err("source_values is empty".to_string());
    }
    for value in &setpoint.source_values {
        if !value.is_finite() || *value == 0.0 {
            return Err(format!("invalid source value {value}"));
        }
        if value.abs() > limits.max_safe_excitation {
            return Err(format!(
                "source value {value:e} exceeds max_safe_excitation {:e}",
                limits.max_safe_excitation
            ));
        }
    }
    if let Some(rate) = setpoint.ramp_rate {
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(format!("invalid ramp rate {rate}"));
        }
    }
    if let Some(tolerance) = setpoint.tolerance {
        if !(tolerance > 0.0 && tolerance.is_finite()) {
            return Err(format!("invalid tolerance {tolerance}"));
        }
    }
    Ok(())
}

// =============================================================================
// Stage programs
// =============================================================================

/// One leg of a temperature program: ramp toward `target_temperature`,
/// measuring every `step_width` kelvin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampStage {
    pub target_temperature: f64,
    /// K/min.
    pub ramp_rate: f64,
    /// Spacing between setpoints in kelvin.
    pub step_width: f64,
    /// Settle window at each setpoint.
    #[serde(with = "humantime_serde")]
    pub wait: Duration,
}

/// A stage list plus the per-setpoint fields the stages don't carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampProgram {
    pub name: String,
    /// Temperature the cryostat sits at when the program starts.
    pub start_temperature: f64,
    /// Supplies `samples_per_point`, `sample_interval`, `source_values`,
    /// `tolerance` and the base `max_settle_wait` of every expanded setpoint.
    pub template: SetpointSpec,
    #[serde(default)]
    pub safety: SafetyLimits,
    #[serde(default)]
    pub policy: RunPolicy,
    pub stages: Vec<RampStage>,
}

impl RampProgram {
    /// Expands the stages into a recipe.
    ///
    /// Each stage produces setpoints spaced `step_width` apart, ending exactly
    /// on the stage target. The stage's starting temperature is excluded, so
    /// consecutive stages never repeat a setpoint.
    pub fn expand(&self) -> Result<RunRecipe, String> {
        let mut recipe = RunRecipe::new(&self.name)
            .with_safety(self.safety)
            .with_policy(self.policy);
        let mut from = self.start_temperature;

        for (index, stage) in self.stages.iter().enumerate() {
            if !(stage.step_width > 0.0 && stage.step_width.is_finite()) {
                return Err(format!("stage {index}: step_width must be > 0"));
            }
            if !(stage.ramp_rate > 0.0 && stage.ramp_rate.is_finite()) {
                return Err(format!("stage {index}: ramp_rate must be > 0"));
            }
            let targets = stage_targets(from, stage.target_temperature, stage.step_width);
            // Worst case: a full ramp over one step, then the settle window.
            let ramp_time = Duration::from_secs_f64(stage.step_width / stage.ramp_rate * 60.0);
            for target in targets {
                let mut setpoint = self.template.clone();
                setpoint.target_temperature = target;
                setpoint.settle_timeout = stage.wait;
                setpoint.max_settle_wait = self.template.max_settle_wait + stage.wait + ramp_time;
                setpoint.ramp_rate = Some(stage.ramp_rate);
                recipe.setpoints.push(setpoint);
            }
            from = stage.target_temperature;
        }
        Ok(recipe)
    }
}

/// Setpoints from `from` (exclusive) to `to` (inclusive), `width` apart.
fn stage_targets(from: f64, to: f64, width: f64) -> Vec<f64> {
    let span = to - from;
    if span == 0.0 {
        return Vec::new();
    }
    let direction = span.signum();
    let count = (span.abs() / width - 1e-9).ceil() as usize;
    let mut targets: Vec<f64> = (0..count)
        .map(|k| to - direction * width * k as f64)
        .collect();
    targets.reverse();
    targets
}
