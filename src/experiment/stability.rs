//! Stability Monitor: decides when a setpoint has settled.
//!
//! After commanding the target, the monitor polls the sample temperature at a
//! fixed interval and keeps the last K readings in a sliding window. The
//! setpoint is stable once the window is full and every reading in it lies
//! within the tolerance band around the target. Controllers that report
//! their own verdict (e.g. "still ramping") can hold stability off.
//!
//! A failed read is skipped without clearing the window; only
//! `max_consecutive_failures` failures in a row give up on the sensor. Every
//! reading passes the temperature hard limit and every poll checks the
//! cryostat alarm level.

use crate::config::StabilityConfig;
use crate::error::{SafetyViolation, StabilityError};
use crate::error_recovery::RetryPolicy;
use crate::experiment::control::ControlReceiver;
use crate::experiment::recipe::{SafetyLimits, SetpointSpec};
use crate::hardware::TemperatureController;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Source of "now" for elapsed-time accounting.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The tokio clock; follows paused time in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<F> Clock for F
where
    F: Fn() -> Instant + Send + Sync,
{
    fn now(&self) -> Instant {
        self()
    }
}

/// Result of a successful stability wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StableReading {
    /// Mean of the window.
    pub temperature: f64,
    /// Peak-to-peak spread of the window.
    pub spread: f64,
    /// Time from the first poll to stability.
    pub elapsed: Duration,
    pub polls: u32,
}

/// Number of readings that span `settle_timeout` at `poll_interval`.
pub fn default_window_len(settle_timeout: Duration, poll_interval: Duration) -> usize {
    let polls = settle_timeout.as_secs_f64() / poll_interval.as_secs_f64();
    (polls - 1e-9).ceil().max(0.0) as usize + 1
}

/// Waits for the sample temperature to settle at a setpoint.
pub struct StabilityMonitor {
    config: StabilityConfig,
    retry: RetryPolicy,
    limits: SafetyLimits,
    alarm_threshold: u8,
    clock: Arc<dyn Clock>,
}

impl StabilityMonitor {
    pub fn new(
        config: StabilityConfig,
        retry: RetryPolicy,
        limits: SafetyLimits,
        alarm_threshold: u8,
    ) -> Self {
        Self {
            config,
            retry,
            limits,
            alarm_threshold,
            clock: Arc::new(TokioClock),
        }
    }

    /// Replaces the clock used for elapsed times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Readings that must sit in band before `setpoint` counts as stable.
    pub fn window_len(&self, setpoint: &SetpointSpec) -> usize {
        self.config
            .window_len
            .unwrap_or_else(|| default_window_len(setpoint.settle_timeout, self.config.poll_interval))
    }

    /// Tolerance band half-width for `setpoint`.
    pub fn tolerance(&self, setpoint: &SetpointSpec) -> f64 {
        setpoint.tolerance.unwrap_or(self.config.tolerance)
    }

    /// Sends the ramp rate (if any) and the target of `setpoint`.
    pub async fn command(
        &self,
        setpoint: &SetpointSpec,
        controller: &mut dyn TemperatureController,
        control: &mut ControlReceiver,
    ) -> Result<(), StabilityError> {
        if let Some(rate) = setpoint.ramp_rate {
            self.send_ramp_rate(controller, control, rate).await?;
        }
        self.send_target(controller, control, setpoint.target_temperature).await
    }

    /// One temperature read followed by the alarm check.
    ///
    /// A failed read yields `Ok(None)` and bumps `failures`; a good one resets
    /// it. Reaching `max_consecutive_failures` gives up on the sensor.
    pub async fn poll(
        &self,
        controller: &mut dyn TemperatureController,
        control: &mut ControlReceiver,
        failures: &mut u32,
    ) -> Result<Option<f64>, StabilityError> {
        let reading = match control.guard(controller.read_temperature()).await? {
            Ok(temperature) => {
                *failures = 0;
                self.limits
                    .check_temperature(temperature)
                    .map_err(StabilityError::SafetyLimitExceeded)?;
                Some(temperature)
            }
            Err(cause) => {
                *failures += 1;
                warn!(failures = *failures, error = %cause, "Temperature read failed");
                if *failures >= self.config.max_consecutive_failures {
                    return Err(StabilityError::SensorUnavailable {
                        failures: *failures,
                        cause,
                    });
                }
                None
            }
        };

        match control.guard(controller.alarm_level()).await? {
            Ok(level) if level >= self.alarm_threshold => Err(StabilityError::SafetyLimitExceeded(
                SafetyViolation::CryostatAlarm {
                    level,
                    threshold: self.alarm_threshold,
                },
            )),
            Ok(_) => Ok(reading),
            Err(e) => {
                warn!(error = %e, "Alarm status unavailable");
                Ok(reading)
            }
        }
    }

    /// Commands `setpoint` and waits until it has settled.
    pub async fn await_stability(
        &self,
        setpoint: &SetpointSpec,
        controller: &mut dyn TemperatureController,
        control: &mut ControlReceiver,
    ) -> Result<StableReading, StabilityError> {
        let target = setpoint.target_temperature;
        let tolerance = self.tolerance(setpoint);
        let window_len = self.window_len(setpoint);

        self.command(setpoint, controller, control).await?;
        info!(target_temperature = target, tolerance, window_len, "Waiting for temperature to settle");

        let start = self.clock.now();
        let mut window: VecDeque<f64> = VecDeque::with_capacity(window_len);
        let mut consecutive_failures = 0;
        let mut last_reading = None;
        let mut polls = 0;

        loop {
            control.check()?;
            polls += 1;

            if let Some(temperature) = self.poll(controller, control, &mut consecutive_failures).await? {
                last_reading = Some(temperature);
                if window.len() == window_len {
                    window.pop_front();
                }
                window.push_back(temperature);
                debug!(temperature, target_temperature = target, filled = window.len(), "Temperature poll");
            }

            let in_band = window.len() == window_len
                && window.iter().all(|t| (t - target).abs() <= tolerance);
            if in_band && self.controller_agrees(controller, control).await? {
                let (min, max) = window
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &t| {
                        (lo.min(t), hi.max(t))
                    });
                let reading = StableReading {
                    temperature: window.iter().sum::<f64>() / window.len() as f64,
                    spread: max - min,
                    elapsed: self.clock.now().duration_since(start),
                    polls,
                };
                info!(
                    target_temperature = target,
                    temperature = reading.temperature,
                    elapsed = ?reading.elapsed,
                    "Temperature stable"
                );
                return Ok(reading);
            }

            let waited = self.clock.now().duration_since(start);
            if waited > setpoint.max_settle_wait {
                warn!(target_temperature = target, ?waited, ?last_reading, "Temperature did not settle");
                return Err(StabilityError::Timeout {
                    target,
                    waited,
                    last_reading,
                });
            }

            control.sleep(self.config.poll_interval).await?;
        }
    }

    async fn controller_agrees(
        &self,
        controller: &mut dyn TemperatureController,
        control: &mut ControlReceiver,
    ) -> Result<bool, StabilityError> {
        match control.guard(controller.is_stable()).await? {
            Ok(Some(false)) => {
                debug!("Readings in band, controller still settling");
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(error = %e, "Controller stability status unavailable");
                Ok(true)
            }
        }
    }

    async fn send_target(
        &self,
        controller: &mut dyn TemperatureController,
        control: &mut ControlReceiver,
        target: f64,
    ) -> Result<(), StabilityError> {
        let mut backoff = self.retry.backoff();
        loop {
            match control.guard(controller.set_target(target)).await? {
                Ok(()) => return Ok(()),
                Err(e) => match backoff.next() {
                    Some(delay) => {
                        warn!(target_temperature = target, error = %e, retry = backoff.retries(), "set_target failed, retrying");
                        control.sleep(delay).await?;
                    }
                    None => return Err(StabilityError::ControllerFault(e)),
                },
            }
        }
    }

    async fn send_ramp_rate(
        &self,
        controller: &mut dyn TemperatureController,
        control: &mut ControlReceiver,
        rate: f64,
    ) -> Result<(), StabilityError> {
        let mut backoff = self.retry.backoff();
        loop {
            match control.guard(controller.set_ramp_rate(rate)).await? {
                Ok(()) => return Ok(()),
                Err(e) => match backoff.next() {
                    Some(delay) => {
                        warn!(rate, error = %e, "set_ramp_rate failed, retrying");
                        control.sleep(delay).await?;
                    }
                    None => return Err(StabilityError::ControllerFault(e)),
                },
            }
        }
    }
}
