//! Acquisition Loop: measures one settled setpoint.
//!
//! For each excitation value, in recipe order:
//!
//! 1. Drive the source to each polarity the reduction needs, waiting the
//!    instrument's settling delay after every level change.
//! 2. Take `samples_per_point` readings, `sample_interval` apart.
//! 3. Read the sample temperature once and reduce everything to a [`Sample`].
//!
//! Single commands and reads are retried with backoff; a step that needed a
//! retry (or fell back to the stability temperature) is `Degraded`. Every
//! response and sensed excitation is checked against the hard limits and
//! never retried past a violation.

use crate::error::{AcquisitionError, AdapterError, SafetyViolation};
use crate::error_recovery::RetryPolicy;
use crate::experiment::control::ControlReceiver;
use crate::experiment::document::{QualityFlag, Sample};
use crate::experiment::recipe::{SafetyLimits, SetpointSpec};
use crate::experiment::reduction::{PolarityReading, Reduction};
use crate::hardware::{
    Hardware, InstrumentReading, InstrumentStatus, SourceMeter, TemperatureController,
};
use chrono::Utc;
use tracing::{debug, info_span, warn, Instrument};

/// Where the setpoint's temperature stands when acquisition begins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetpointContext {
    pub setpoint_index: usize,
    /// Fallback when a temperature read fails during acquisition.
    pub stable_temperature: f64,
    /// Lowest quality any sample of this setpoint can have.
    pub baseline_quality: QualityFlag,
}

pub struct AcquisitionLoop {
    retry: RetryPolicy,
    limits: SafetyLimits,
    alarm_threshold: u8,
    reduction: Box<dyn Reduction>,
}

impl AcquisitionLoop {
    pub fn new(
        retry: RetryPolicy,
        limits: SafetyLimits,
        alarm_threshold: u8,
        reduction: Box<dyn Reduction>,
    ) -> Self {
        Self {
            retry,
            limits,
            alarm_threshold,
            reduction,
        }
    }

    pub fn reduction(&self) -> &dyn Reduction {
        self.reduction.as_ref()
    }

    /// Measures every excitation value of `setpoint`.
    ///
    /// Samples come back in `source_values` order. Nothing is returned for a
    /// setpoint that fails part-way.
    pub async fn acquire(
        &self,
        context: SetpointContext,
        setpoint: &SetpointSpec,
        hardware: &mut Hardware,
        control: &mut ControlReceiver,
    ) -> Result<Vec<Sample>, AcquisitionError> {
        let Hardware { source, controller } = hardware;
        match control.guard(source.get_status()).await? {
            Ok(InstrumentStatus::Ready) => {}
            Ok(status) => warn!(source = source.id(), ?status, "Source not ready, measuring anyway"),
            Err(e) => warn!(source = source.id(), error = %e, "Source status query failed"),
        }
        let mut samples = Vec::with_capacity(setpoint.source_values.len());

        for (excitation_index, &value) in setpoint.source_values.iter().enumerate() {
            let span = info_span!(
                "excitation",
                setpoint = context.setpoint_index,
                excitation = value
            );
            let sample = self
                .acquire_step(
                    context,
                    setpoint,
                    excitation_index,
                    value,
                    source.as_mut(),
                    controller.as_mut(),
                    control,
                )
                .instrument(span)
                .await?;
            samples.push(sample);
        }
        Ok(samples)
    }

    #[allow(clippy::too_many_arguments)]
    async fn acquire_step(
        &self,
        context: SetpointContext,
        setpoint: &SetpointSpec,
        excitation_index: usize,
        value: f64,
        source: &mut dyn SourceMeter,
        controller: &mut dyn TemperatureController,
        control: &mut ControlReceiver,
    ) -> Result<Sample, AcquisitionError> {
        let mut quality = context.baseline_quality;
        let mut groups = Vec::with_capacity(setpoint.samples_per_point as usize);
        let mut current_level = None;

        for reading_index in 0..setpoint.samples_per_point {
            if reading_index > 0 {
                control.sleep(setpoint.sample_interval).await?;
            }

            let mut group = Vec::with_capacity(self.reduction.polarities().len());
            for &polarity in self.reduction.polarities() {
                let level = value * polarity;
                if current_level != Some(level) {
                    if self.set_level(source, control, level).await? > 0 {
                        quality = QualityFlag::Degraded;
                    }
                    control.sleep(source.settling_delay()).await?;
                    current_level = Some(level);
                }

                let (reading, retries) = self.read(source, control, value).await?;
                if retries > 0 {
                    quality = QualityFlag::Degraded;
                }
                self.check_reading(&reading)?;
                group.push(PolarityReading {
                    commanded: level,
                    response: reading.response,
                    sensed_excitation: reading.sensed_excitation,
                });
            }
            groups.push(group);
        }

        let (temperature, temperature_quality) =
            self.read_temperature(controller, control, context.stable_temperature).await?;
        quality = quality.worst(temperature_quality);

        let reduced = self.reduction.reduce(&groups);
        debug!(
            resistance = reduced.resistance,
            spread = reduced.spread,
            %quality,
            "Excitation step reduced"
        );

        Ok(Sample {
            setpoint_index: context.setpoint_index,
            excitation_index,
            timestamp: Utc::now(),
            measured_temperature: temperature,
            excitation_value: value,
            measured_response: reduced.response,
            derived_resistance: reduced.resistance,
            resistance_spread: reduced.spread,
            readings: setpoint.samples_per_point,
            quality_flag: quality,
        })
    }

    pub(crate) fn check_reading(&self, reading: &InstrumentReading) -> Result<(), AcquisitionError> {
        self.limits
            .check_response(reading.response)
            .map_err(AcquisitionError::SafetyLimitExceeded)?;
        if let Some(sensed) = reading.sensed_excitation {
            self.limits
                .check_excitation(sensed)
                .map_err(AcquisitionError::SafetyLimitExceeded)?;
        }
        Ok(())
    }

    /// Sets the source level. Returns the number of retries it took.
    pub(crate) async fn set_level(
        &self,
        source: &mut dyn SourceMeter,
        control: &mut ControlReceiver,
        level: f64,
    ) -> Result<u32, AcquisitionError> {
        self.limits
            .check_excitation(level)
            .map_err(AcquisitionError::SafetyLimitExceeded)?;

        let mut backoff = self.retry.backoff();
        loop {
            match control.guard(source.set_source(level)).await? {
                Ok(()) => return Ok(backoff.retries()),
                Err(cause) => match backoff.next() {
                    Some(delay) => {
                        warn!(excitation = level, error = %cause, retry = backoff.retries(), "set_source failed, retrying");
                        control.sleep(delay).await?;
                    }
                    None => {
                        return Err(AcquisitionError::InstrumentFault {
                            excitation: level,
                            attempts: backoff.attempts(),
                            cause,
                        })
                    }
                },
            }
        }
    }

    /// Takes one reading. Returns it with the number of retries it took.
    pub(crate) async fn read(
        &self,
        source: &mut dyn SourceMeter,
        control: &mut ControlReceiver,
        excitation: f64,
    ) -> Result<(InstrumentReading, u32), AcquisitionError> {
        let mut backoff = self.retry.backoff();
        loop {
            match control.guard(source.read_measurement()).await? {
                Ok(reading) => return Ok((reading, backoff.retries())),
                Err(cause) => match backoff.next() {
                    Some(delay) => {
                        warn!(error = %cause, retry = backoff.retries(), "Read failed, retrying");
                        control.sleep(delay).await?;
                    }
                    None => {
                        return Err(AcquisitionError::InstrumentFault {
                            excitation,
                            attempts: backoff.attempts(),
                            cause,
                        })
                    }
                },
            }
        }
    }

    /// Temperature for the sample. Falls back to `fallback` (as `Degraded`)
    /// when the sensor keeps failing, but never skips the hard limits.
    async fn read_temperature(
        &self,
        controller: &mut dyn TemperatureController,
        control: &mut ControlReceiver,
        fallback: f64,
    ) -> Result<(f64, QualityFlag), AcquisitionError> {
        let mut backoff = self.retry.backoff();
        let mut last_error: Option<AdapterError> = None;
        let (temperature, quality) = loop {
            match control.guard(controller.read_temperature()).await? {
                Ok(t) => {
                    let quality = if backoff.retries() > 0 {
                        QualityFlag::Degraded
                    } else {
                        QualityFlag::Normal
                    };
                    break (t, quality);
                }
                Err(cause) => {
                    last_error = Some(cause);
                    match backoff.next() {
                        Some(delay) => control.sleep(delay).await?,
                        None => break (fallback, QualityFlag::Degraded),
                    }
                }
            }
        };
        if quality == QualityFlag::Degraded {
            if let Some(cause) = last_error {
                warn!(error = %cause, temperature, "Sample temperature read needed fallback or retry");
            }
        }

        self.limits
            .check_temperature(temperature)
            .map_err(AcquisitionError::SafetyLimitExceeded)?;
        match control.guard(controller.alarm_level()).await? {
            Ok(level) if level >= self.alarm_threshold => Err(AcquisitionError::SafetyLimitExceeded(
                SafetyViolation::CryostatAlarm {
                    level,
                    threshold: self.alarm_threshold,
                },
            )),
            Ok(_) => Ok((temperature, quality)),
            Err(e) => {
                warn!(error = %e, "Alarm status unavailable");
                Ok((temperature, quality))
            }
        }
    }
}
