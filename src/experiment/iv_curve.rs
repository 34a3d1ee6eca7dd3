//! I-V curve: the response over a geometric excitation ramp.
//!
//! Starting at `min_excitation`, every level is driven at `+I` and then `-I`
//! and `readings_per_polarity` points are recorded at each, together with
//! the sample temperature. The level is then multiplied by `step_factor`.
//! The first level at or past the maximum is clamped to it and measured
//! once; the ramp ends there.
//!
//! Unlike [`ExcitationCalibration`](super::ExcitationCalibration) nothing is
//! accepted or rejected: every point is returned for the caller to fit.

use crate::error::{AcquisitionError, RunError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::acquisition::AcquisitionLoop;
use crate::experiment::control::ControlReceiver;
use crate::experiment::recipe::SafetyLimits;
use crate::experiment::reduction::FourPoint;
use crate::hardware::{Hardware, SourceMeter, TemperatureController};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Ramp bounds and sampling of an I-V curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IvCurveParams {
    pub min_excitation: f64,
    /// Clamped to the `max_safe_excitation` limit.
    pub max_excitation: f64,
    pub step_factor: f64,
    pub readings_per_polarity: u32,
    /// Delay between readings.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for IvCurveParams {
    fn default() -> Self {
        Self {
            min_excitation: 1e-9,
            max_excitation: 1e-4,
            step_factor: 10.0,
            readings_per_polarity: 10,
            interval: Duration::from_millis(100),
        }
    }
}

impl IvCurveParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.min_excitation > 0.0 && self.min_excitation.is_finite()) {
            return Err(format!("min_excitation must be > 0, got {}", self.min_excitation));
        }
        if !(self.max_excitation >= self.min_excitation && self.max_excitation.is_finite()) {
            return Err(format!(
                "max_excitation {} is below min_excitation {}",
                self.max_excitation, self.min_excitation
            ));
        }
        if !(self.step_factor > 1.0 && self.step_factor.is_finite()) {
            return Err(format!("step_factor must be > 1, got {}", self.step_factor));
        }
        if self.readings_per_polarity == 0 {
            return Err("readings_per_polarity must be >= 1".to_string());
        }
        Ok(())
    }
}

/// One recorded reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IvPoint {
    /// Signed commanded excitation.
    pub excitation: f64,
    pub sensed_excitation: Option<f64>,
    pub response: f64,
    /// Response over sensed (or commanded) excitation.
    pub resistance: f64,
    /// `None` when the sensor did not answer.
    pub temperature: Option<f64>,
    /// Since the start of the curve.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Records an [`IvPoint`] list over the excitation ramp.
pub struct IvCurve {
    params: IvCurveParams,
    limits: SafetyLimits,
    acquisition: AcquisitionLoop,
}

impl IvCurve {
    pub fn new(params: IvCurveParams, retry: RetryPolicy, limits: SafetyLimits) -> Self {
        // the cryostat alarm is not polled during an I-V curve
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

    /// Positive levels in measurement order, the ceiling last.
    pub fn levels(&self) -> Vec<f64> {
        let ceiling = self.ceiling();
        let mut levels = Vec::new();
        let mut level = self.params.min_excitation;
        while level < ceiling * (1.0 - 1e-9) {
            levels.push(level);
            level *= self.params.step_factor;
        }
        levels.push(ceiling);
        levels
    }

    /// Runs the ramp. Leaves the source enabled; the caller restores the
    /// safe state.
    pub async fn run(
        &self,
        hardware: &mut Hardware,
        control: &mut ControlReceiver,
    ) -> Result<Vec<IvPoint>, RunError> {
        self.params.validate().map_err(RunError::InvalidParameters)?;
        if self.params.min_excitation > self.ceiling() {
            return Err(RunError::InvalidParameters(format!(
                "min_excitation {:e} exceeds the excitation limit {:e}",
                self.params.min_excitation,
                self.ceiling()
            )));
        }

        let levels = self.levels();
        info!(levels = levels.len(), ceiling = self.ceiling(), "Starting I-V curve");
        let Hardware { source, controller } = hardware;
        let start = Instant::now();
        let mut points = Vec::with_capacity(levels.len() * 2 * self.params.readings_per_polarity as usize);

        for level in levels {
            for signed in [level, -level] {
                self.polarity(source.as_mut(), controller.as_mut(), control, signed, start, &mut points)
                    .await
                    .map_err(RunError::IvCurve)?;
            }
            debug!(excitation = level, points = points.len(), "I-V level done");
        }
        info!(points = points.len(), "I-V curve finished");
        Ok(points)
    }

    async fn polarity(
        &self,
        source: &mut dyn SourceMeter,
        controller: &mut dyn TemperatureController,
        control: &mut ControlReceiver,
        level: f64,
        start: Instant,
        points: &mut Vec<IvPoint>,
    ) -> Result<(), AcquisitionError> {
        let retries = self.acquisition.set_level(source, control, level).await?;
        if retries > 0 {
            warn!(excitation = level, retries, "I-V level needed retries");
        }
        control.sleep(source.settling_delay()).await?;

        for index in 0..self.params.readings_per_polarity {
            if index > 0 {
                control.sleep(self.params.interval).await?;
            }
            let (reading, _) = self.acquisition.read(source, control, level).await?;
            self.acquisition.check_reading(&reading)?;

            let temperature = match control.guard(controller.read_temperature()).await? {
                Ok(t) => {
                    self.limits
                        .check_temperature(t)
                        .map_err(AcquisitionError::SafetyLimitExceeded)?;
                    Some(t)
                }
                Err(e) => {
                    debug!(error = %e, "No temperature for I-V point");
                    None
                }
            };
            let current = reading.sensed_excitation.unwrap_or(level);
            points.push(IvPoint {
                excitation: level,
                sensed_excitation: reading.sensed_excitation,
                response: reading.response,
                resistance: reading.response / current,
                temperature,
                elapsed: start.elapsed(),
            });
        }
        Ok(())
    }
}
