//! Custom error types for the application.
//!
//! Errors are layered the same way the measurement run is layered:
//!
//! - **`AdapterError`**: transport-level failures reported by an instrument or
//!   temperature-controller driver (timeouts, rejected commands, lost links).
//!   These are retried locally and only escalate once retries are exhausted.
//! - **`StabilityError`**: the temperature never settled, the sensor stopped
//!   answering, or a reading tripped a hard limit while waiting.
//! - **`AcquisitionError`**: an excitation step could not be measured, or a
//!   measured value tripped a hard limit.
//! - **`RunError`**: everything a host interface can see from the run
//!   control surface (busy hardware, invalid recipes, failed runs).
//!
//! Every error maps onto a flat [`ErrorKind`] so events can carry a
//! structured cause next to the human-readable message.

use crate::experiment::control::Interrupt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the run error type.
pub type AppResult<T> = std::result::Result<T, RunError>;

/// Flat classification of every failure the engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An adapter call timed out.
    AdapterTimeout,
    /// An instrument rejected a command.
    AdapterNack,
    /// An instrument link was lost.
    AdapterDisconnected,
    /// The temperature did not settle within `max_settle_wait`.
    StabilityTimeout,
    /// Too many consecutive temperature read failures.
    SensorUnavailable,
    /// The temperature controller refused a setpoint.
    ControllerFault,
    /// An excitation step failed after all retries.
    InstrumentFault,
    /// A hard limit was crossed.
    SafetyLimitExceeded,
    /// Another run holds the instruments.
    HardwareBusy,
    /// The recipe or measurement parameters failed validation.
    InvalidRecipe,
    /// A control request did not fit the run state.
    InvalidState,
    /// The run was aborted or interrupted by the operator.
    OperatorAbort,
    /// The excitation calibration gave up.
    CalibrationFailed,
    /// File or OS error.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AdapterTimeout => "adapter_timeout",
            ErrorKind::AdapterNack => "adapter_nack",
            ErrorKind::AdapterDisconnected => "adapter_disconnected",
            ErrorKind::StabilityTimeout => "stability_timeout",
            ErrorKind::SensorUnavailable => "sensor_unavailable",
            ErrorKind::ControllerFault => "controller_fault",
            ErrorKind::InstrumentFault => "instrument_fault",
            ErrorKind::SafetyLimitExceeded => "safety_limit_exceeded",
            ErrorKind::HardwareBusy => "hardware_busy",
            ErrorKind::InvalidRecipe => "invalid_recipe",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::OperatorAbort => "operator_abort",
            ErrorKind::CalibrationFailed => "calibration_failed",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

/// Transport-level failure reported by a driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("Instrument timed out after {0:?}")]
    Timeout(Duration),

    #[error("Instrument rejected command: {0}")]
    Nack(String),

    #[error("Instrument disconnected")]
    Disconnected,
}

impl AdapterError {
    /// Structured classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Timeout(_) => ErrorKind::AdapterTimeout,
            AdapterError::Nack(_) => ErrorKind::AdapterNack,
            AdapterError::Disconnected => ErrorKind::AdapterDisconnected,
        }
    }
}

/// A hard safety limit that a reading or command crossed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum SafetyViolation {
    /// Sample temperature above `max_safe_temperature` (K).
    Temperature { measured: f64, limit: f64 },
    /// Commanded or sensed excitation above `max_safe_excitation` (A).
    Excitation { value: f64, limit: f64 },
    /// Measured response above `max_safe_response` (V).
    Response { measured: f64, limit: f64 },
    /// Cryostat alarm at or above the configured threshold.
    CryostatAlarm { level: u8, threshold: u8 },
}

impl fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyViolation::Temperature { measured, limit } => {
                write!(f, "temperature {measured} K exceeds limit {limit} K")
            }
            SafetyViolation::Excitation { value, limit } => {
                write!(f, "excitation {value:e} exceeds limit {limit:e}")
            }
            SafetyViolation::Response { measured, limit } => {
                write!(f, "response {measured:e} exceeds limit {limit:e}")
            }
            SafetyViolation::CryostatAlarm { level, threshold } => {
                write!(f, "cryostat alarm level {level} (threshold {threshold})")
            }
        }
    }
}

/// Failure while waiting for a setpoint to settle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StabilityError {
    #[error("Temperature did not settle at {target} K within {waited:?} (last reading: {last_reading:?})")]
    Timeout {
        target: f64,
        waited: Duration,
        last_reading: Option<f64>,
    },

    #[error("Temperature sensor unavailable after {failures} consecutive failures: {cause}")]
    SensorUnavailable { failures: u32, cause: AdapterError },

    #[error("Temperature controller did not accept setpoint: {0}")]
    ControllerFault(AdapterError),

    #[error("Safety limit exceeded: {0}")]
    SafetyLimitExceeded(SafetyViolation),

    #[error("Stability wait interrupted: {0}")]
    Interrupted(Interrupt),
}

impl StabilityError {
    /// Structured classification; interruptions count as operator aborts.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StabilityError::Timeout { .. } => ErrorKind::StabilityTimeout,
            StabilityError::SensorUnavailable { .. } => ErrorKind::SensorUnavailable,
            StabilityError::ControllerFault(_) => ErrorKind::ControllerFault,
            StabilityError::SafetyLimitExceeded(_) => ErrorKind::SafetyLimitExceeded,
            StabilityError::Interrupted(_) => ErrorKind::OperatorAbort,
        }
    }
}

/// Failure while measuring a settled setpoint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AcquisitionError {
    #[error("Instrument fault at excitation {excitation:e} after {attempts} attempts: {cause}")]
    InstrumentFault {
        excitation: f64,
        attempts: u32,
        cause: AdapterError,
    },

    #[error("Safety limit exceeded: {0}")]
    SafetyLimitExceeded(SafetyViolation),

    #[error("Acquisition interrupted: {0}")]
    Interrupted(Interrupt),
}

impl AcquisitionError {
    /// Structured classification; interruptions count as operator aborts.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcquisitionError::InstrumentFault { .. } => ErrorKind::InstrumentFault,
            AcquisitionError::SafetyLimitExceeded(_) => ErrorKind::SafetyLimitExceeded,
            AcquisitionError::Interrupted(_) => ErrorKind::OperatorAbort,
        }
    }
}

impl From<Interrupt> for AcquisitionError {
    fn from(interrupt: Interrupt) -> Self {
        AcquisitionError::Interrupted(interrupt)
    }
}

impl From<Interrupt> for StabilityError {
    fn from(interrupt: Interrupt) -> Self {
        StabilityError::Interrupted(interrupt)
    }
}

/// Errors surfaced through the run control surface.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Hardware is busy: another run holds the instrument set")]
    HardwareBusy,

    #[error("Invalid recipe: {0}")]
    InvalidRecipe(String),

    #[error("Operation not valid while run is {0}")]
    InvalidState(String),

    #[error("Setpoint {setpoint_index}: {source}")]
    Stability {
        setpoint_index: usize,
        #[source]
        source: StabilityError,
    },

    #[error("Setpoint {setpoint_index}: {source}")]
    Acquisition {
        setpoint_index: usize,
        #[source]
        source: AcquisitionError,
    },

    #[error("Excitation calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("I-V curve failed: {0}")]
    IvCurve(#[source] AcquisitionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Structured classification, taken from the wrapped cause where there is one.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::HardwareBusy => ErrorKind::HardwareBusy,
            RunError::InvalidRecipe(_) => ErrorKind::InvalidRecipe,
            RunError::InvalidState(_) => ErrorKind::InvalidState,
            RunError::Stability { source, .. } => source.kind(),
            RunError::Acquisition { source, .. } => source.kind(),
            RunError::CalibrationFailed(_) => ErrorKind::CalibrationFailed,
            RunError::InvalidParameters(_) => ErrorKind::InvalidRecipe,
            RunError::IvCurve(source) => source.kind(),
            RunError::Io(_) => ErrorKind::Io,
        }
    }
}
