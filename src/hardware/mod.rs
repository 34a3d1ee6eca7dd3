//! Hardware capabilities consumed by the run engine.
//!
//! The engine never talks to a transport. It drives two capabilities:
//!
//! - [`SourceMeter`]: the source / sense instrument pair (e.g. a current
//!   source with a nanovoltmeter). Sets the excitation and reads the response.
//! - [`TemperatureController`]: the cryostat. Takes a target temperature and
//!   reports the sample temperature.
//!
//! Drivers implement these traits; vendor cryostat software and VISA/GPIB
//! plumbing live behind them. Both are bundled into a [`HardwareSet`], which
//! is the run-scoped lock: only one run (or calibration) at a time can hold
//! the instruments.

pub mod mock;

use crate::error::{AdapterError, RunError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Coarse instrument state reported by [`SourceMeter::get_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentStatus {
    /// Idle and accepting commands.
    Ready,
    /// Still executing a previous command.
    Busy,
    /// Reports an error condition.
    Fault,
}

/// One reading of the sense instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstrumentReading {
    /// Measured response, usually a voltage.
    pub response: f64,
    /// Source value the instrument actually delivered, if it reports one.
    pub sensed_excitation: Option<f64>,
}

impl InstrumentReading {
    pub fn new(response: f64) -> Self {
        Self {
            response,
            sensed_excitation: None,
        }
    }
}

/// Source / sense instrument capability.
#[async_trait]
pub trait SourceMeter: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    /// Sets the source output (signed) and enables it.
    async fn set_source(&mut self, value: f64) -> Result<(), AdapterError>;

    /// Takes one reading at the current source value.
    async fn read_measurement(&mut self) -> Result<InstrumentReading, AdapterError>;

    /// Sets the source to zero and disables the output.
    async fn zero_and_disable(&mut self) -> Result<(), AdapterError>;

    /// Coarse instrument state. Drivers without a status query report `Ready`.
    async fn get_status(&self) -> Result<InstrumentStatus, AdapterError> {
        Ok(InstrumentStatus::Ready)
    }

    /// How long to wait after `set_source` before reading.
    fn settling_delay(&self) -> Duration {
        Duration::from_millis(100)
    }
}

/// Cryostat / temperature controller capability.
#[async_trait]
pub trait TemperatureController: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    /// Sets the target temperature in kelvin.
    async fn set_target(&mut self, temperature: f64) -> Result<(), AdapterError>;

    /// Reads the sample temperature in kelvin.
    async fn read_temperature(&mut self) -> Result<f64, AdapterError>;

    /// The controller's own stability verdict, if it has one.
    ///
    /// `Some(false)` (e.g. still ramping) holds off stability even when the
    /// readings are in band.
    async fn is_stable(&mut self) -> Result<Option<bool>, AdapterError> {
        Ok(None)
    }

    /// Ramp rate in K/min for the next `set_target`. Controllers without
    /// ramping ignore it.
    async fn set_ramp_rate(&mut self, _kelvin_per_minute: f64) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Alarm level reported by the controller, 0 when healthy.
    async fn alarm_level(&mut self) -> Result<u8, AdapterError> {
        Ok(0)
    }
}

/// The instruments a run drives.
pub struct Hardware {
    pub source: Box<dyn SourceMeter>,
    pub controller: Box<dyn TemperatureController>,
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware").finish_non_exhaustive()
    }
}

/// Exclusive hold on a [`HardwareSet`], released on drop.
pub type HardwareLease = OwnedMutexGuard<Hardware>;

/// Shared handle to one instrument set. Cloning shares the same lock.
#[derive(Clone)]
pub struct HardwareSet {
    inner: Arc<Mutex<Hardware>>,
}

impl HardwareSet {
    pub fn new(
        source: impl SourceMeter + 'static,
        controller: impl TemperatureController + 'static,
    ) -> Self {
        Self::from_boxed(Box::new(source), Box::new(controller))
    }

    pub fn from_boxed(
        source: Box<dyn SourceMeter>,
        controller: Box<dyn TemperatureController>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Hardware { source, controller })),
        }
    }

    /// Takes the run lock without waiting.
    pub fn try_acquire(&self) -> Result<HardwareLease, RunError> {
        self.inner
            .clone()
            .try_lock_owned()
            .map_err(|_| RunError::HardwareBusy)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl std::fmt::Debug for HardwareSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareSet")
            .field("busy", &self.is_busy())
            .finish()
    }
}
