//! Excitation calibration: finds the smallest usable excitation.
//!
//! Starting at `min_excitation`, the source is driven to `+I` and `-I` and
//! `readings_per_polarity` resistances are taken at each. When the relative
//! spread of the readings is under `spread_limit` the level is accepted;
//! otherwise it is multiplied by `step_factor` and tried again.
//!
//! The first time a step would overshoot the maximum, the ramp backs off one
//! step and continues with a finer factor (a fifth of the old one, or
//! straight to the maximum once the factor is already small). Overshooting
//! a second time fails the calibration.

use crate::error::{AcquisitionError, RunError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::acquisition::AcquisitionLoop;
use crate::experiment::control::ControlReceiver;
use crate::experiment::recipe::SafetyLimits;
use crate::experiment::reduction::{mean, FourPoint};
use crate::hardware::SourceMeter;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationParams {
    pub min_excitation: f64,
    /// Clamped to the recipe's `max_safe_excitation`.
    pub max_excitation: f64,
    pub step_factor: f64,
    pub readings_per_polarity: u32,
    /// Delay between readings.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Largest accepted relative standard deviation.
    pub spread_limit: f64,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            min_excitation: 50e-12,
            max_excitation: 1e-3,
            step_factor: 10.0,
            readings_per_polarity: 10,
            interval: Duration::from_millis(100),
            spread_limit: 0.05,
        }
    }
}

impl CalibrationParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.min_excitation > 0.0 && self.min_excitation.is_finite()) {
            return Err(format!("min_excitation must be > 0, got {}", self.min_excitation));
        }
        if !(self.max_excitation >= self.min_excitation) {
            return Err(format!(
                "max_excitation {} is below min_excitation {}",
                self.max_excitation, self.min_excitation
            ));
        }
        if !(self.step_factor > 1.0) {
            return Err(format!("step_factor must be > 1, got {}", self.step_factor));
        }
        if self.readings_per_polarity == 0 {
            return Err("readings_per_polarity must be >= 1".to_string());
        }
        if !(self.spread_limit > 0.0) {
            return Err(format!("spread_limit must be > 0, got {}", self.spread_limit));
        }
        Ok(())
    }
}

/// One tried excitation level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStep {
    pub excitation: f64,
    pub resistance: f64,
    pub spread: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// Accepted excitation level.
    pub excitation: f64,
    pub resistance: f64,
    pub spread: f64,
    /// Every level tried, the accepted one last.
    pub steps: Vec<CalibrationStep>,
}

pub struct ExcitationCalibration {
    params: CalibrationParams,
    limits: SafetyLimits,
    acquisition: AcquisitionLoop,
}

impl ExcitationCalibration {
    pub fn new(params: CalibrationParams, retry: RetryPolicy, limits: SafetyLimits) -> Self {
        // The cryostat is not touched here, so the alarm threshold is unused.
        let acquisition = AcquisitionLoop::new(retry, limits, u8::MAX, Box::new(FourPoint));
        Self {
            params,
            limits,
            acquisition,
        }
    }

    /// Highest level the ramp may reach.
    pub fn ceiling(&self) -> f64 {
        self.params.max_excitation.min(self.limits.max_safe_excitation)
    }

    /// Runs the ramp. Leaves the source enabled; the caller restores the
    /// safe state.
    pub async fn run(
        &self,
        source: &mut dyn SourceMeter,
        control: &mut ControlReceiver,
    ) -> Result<CalibrationResult, RunError> {
        self.params.validate().map_err(RunError::CalibrationFailed)?;
        let ceiling = self.ceiling();
        if self.params.min_excitation > ceiling {
            return Err(RunError::CalibrationFailed(format!(
                "min_excitation {:e} exceeds the excitation limit {:e}",
                self.params.min_excitation, ceiling
            )));
        }

        let mut level = self.params.min_excitation;
        let mut factor = self.params.step_factor;
        let mut refined = false;
        let mut steps = Vec::new();

        loop {
            if level > ceiling {
                if refined {
                    return Err(RunError::CalibrationFailed(format!(
                        "no excitation up to {:e} reached a spread below {}",
                        ceiling, self.params.spread_limit
                    )));
                }
                refined = true;
                if factor > 5.0 {
                    level /= factor;
                    factor /= 5.0;
                    level = (level * factor).min(ceiling);
                } else {
                    level = ceiling;
                }
                debug!(excitation = level, factor, "Refining calibration step");
            }

            let step = self.measure(source, control, level).await.map_err(|e| {
                RunError::CalibrationFailed(format!("at excitation {:e}: {}", level, e))
            })?;
            info!(
                excitation = step.excitation,
                resistance = step.resistance,
                spread = step.spread,
                "Calibration step"
            );
            steps.push(step);

            if step.spread < self.params.spread_limit {
                return Ok(CalibrationResult {
                    excitation: step.excitation,
                    resistance: step.resistance,
                    spread: step.spread,
                    steps,
                });
            }
            level *= factor;
        }
    }

    async fn measure(
        &self,
        source: &mut dyn SourceMeter,
        control: &mut ControlReceiver,
        level: f64,
    ) -> Result<CalibrationStep, AcquisitionError> {
        let positive = self.polarity(source, control, level).await?;
        let negative = self.polarity(source, control, -level).await?;

        let resistance = (positive.0 + negative.0) / 2.0;
        let deviation = (positive.1 + negative.1) / 2.0;
        let spread = if resistance == 0.0 {
            f64::INFINITY
        } else {
            (deviation / resistance).abs()
        };
        Ok(CalibrationStep {
            excitation: level,
            resistance,
            spread,
        })
    }

    /// Mean and population standard deviation of U/I at one level.
    async fn polarity(
        &self,
        source: &mut dyn SourceMeter,
        control: &mut ControlReceiver,
        level: f64,
    ) -> Result<(f64, f64), AcquisitionError> {
        let retries = self.acquisition.set_level(source, control, level).await?;
        if retries > 0 {
            warn!(excitation = level, retries, "Calibration level needed retries");
        }
        control.sleep(source.settling_delay()).await?;

        let mut resistances = Vec::with_capacity(self.params.readings_per_polarity as usize);
        for index in 0..self.params.readings_per_polarity {
            if index > 0 {
                control.sleep(self.params.interval).await?;
            }
            let (reading, _) = self.acquisition.read(source, control, level).await?;
            self.acquisition.check_reading(&reading)?;
            let current = reading.sensed_excitation.unwrap_or(level);
            resistances.push(reading.response / current);
        }

        let average = mean(&resistances);
        let variance = resistances
            .iter()
            .map(|r| (r - average).powi(2))
            .sum::<f64>()
            / resistances.len() as f64;
        Ok((average, variance.sqrt()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::experiment::control;
    use crate::hardware::mock::ScriptedSourceMeter;

    fn calibration(params: CalibrationParams) -> ExcitationCalibration {
        ExcitationCalibration::new(params, RetryPolicy::default(), SafetyLimits::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramps_until_spread_is_small() {
        let mut meter = ScriptedSourceMeter::new(100.0).with_noise_floor(1e-6);
        let remote = meter.remote();
        let (_handle, mut rx) = control::channel();

        let result = calibration(CalibrationParams::default())
            .run(&mut meter, &mut rx)
            .await
            .unwrap();

        // 5e-11 .. 5e-8 are too noisy, 5e-7 gives a 2 % spread
        assert_eq!(result.steps.len(), 5);
        assert!((result.excitation - 5e-7).abs() < 1e-15);
        assert!((result.spread - 0.02).abs() < 1e-6);
        assert!((result.resistance - 100.0).abs() < 1e-6);
        assert_eq!(remote.reads(), 5 * 2 * 10);

        let calls = remote.set_source_calls();
        assert_eq!(calls.len(), 10);
        assert!(calls[1] < 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_past_ceiling() {
        let mut meter = ScriptedSourceMeter::new(100.0).with_noise_floor(1e-6);
        let (_handle, mut rx) = control::channel();
        let params = CalibrationParams {
            max_excitation: 1e-8,
            readings_per_polarity: 4,
            ..CalibrationParams::default()
        };

        let err = calibration(params).run(&mut meter, &mut rx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CalibrationFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_follows_safety_limit() {
        let limits = SafetyLimits {
            max_safe_excitation: 1e-6,
            ..SafetyLimits::default()
        };
        let cal = ExcitationCalibration::new(CalibrationParams::default(), RetryPolicy::none(), limits);
        assert_eq!(cal.ceiling(), 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_calibration() {
        let mut meter = ScriptedSourceMeter::new(100.0).with_noise_floor(1e-6);
        let (handle, mut rx) = control::channel();
        handle.abort("operator");

        let err = calibration(CalibrationParams::default())
            .run(&mut meter, &mut rx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("operator"), "{err}");
    }

    #[test]
    fn test_params_validation() {
        assert!(CalibrationParams::default().validate().is_ok());
        let bad = CalibrationParams {
            step_factor: 1.0,
            ..CalibrationParams::default()
        };
        assert!(bad.validate().is_err());
    }
}
