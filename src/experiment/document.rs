//! Run data model: samples, events and run state.
//!
//! A run produces two streams:
//!
//! - **Samples**: one fully reduced data point per excitation step.
//! - **Events**: the ordered audit log of the run, from `RunStarted` to exactly
//!   one terminal `RunCompleted` or `RunAborted`.
//!
//! # Event Flow
//!
//! ```text
//! RunStarted (1)
//!    │
//!    ├── StartedStep ── StabilityReached ── SampleAcquired (N) ── SetpointCompleted
//!    │       (per setpoint, repeated on retry or after a pause)
//!    │
//! RunCompleted | RunAborted (1)
//! ```
//!
//! Every event that reports a failure carries an [`EventError`] with the
//! structured [`ErrorKind`] next to the human-readable message.

use crate::error::ErrorKind;
use crate::experiment::recipe::{AcquisitionErrorPolicy, TimeoutPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Generate a new unique run ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Quality of a sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityFlag {
    #[default]
    Normal,
    /// A reading needed a retry, a fallback value was used, or the
    /// temperature never settled.
    Degraded,
}

impl QualityFlag {
    pub fn worst(self, other: QualityFlag) -> QualityFlag {
        self.max(other)
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityFlag::Normal => f.write_str("normal"),
            QualityFlag::Degraded => f.write_str("degraded"),
        }
    }
}

/// One reduced data point. Emitted by value; the engine keeps no copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub setpoint_index: usize,
    /// Position of the excitation value within the setpoint's `source_values`.
    pub excitation_index: usize,
    pub timestamp: DateTime<Utc>,
    /// Kelvin.
    pub measured_temperature: f64,
    /// Excitation value from the recipe.
    pub excitation_value: f64,
    pub measured_response: f64,
    /// Ohms.
    pub derived_resistance: f64,
    /// Relative standard deviation of the individual resistances.
    pub resistance_spread: f64,
    /// Number of readings reduced into this sample.
    pub readings: u32,
    pub quality_flag: QualityFlag,
}

/// Structured cause attached to failure events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EventError {
    pub fn new(kind: ErrorKind, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// `abort()` was called.
    Operator,
    /// An unrecoverable error or an `AbortRun` policy.
    Fault,
    /// A hard limit was crossed.
    SafetyInterlock,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Operator => f.write_str("operator abort"),
            AbortReason::Fault => f.write_str("fault"),
            AbortReason::SafetyInterlock => f.write_str("safety interlock"),
        }
    }
}

/// Terminal error of a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub reason: AbortReason,
    pub kind: ErrorKind,
    pub setpoint_index: Option<usize>,
    pub message: String,
}

impl RunFailure {
    pub fn operator(message: &str, setpoint_index: Option<usize>) -> Self {
        Self {
            reason: AbortReason::Operator,
            kind: ErrorKind::OperatorAbort,
            setpoint_index,
            message: message.to_string(),
        }
    }

    pub fn fault(kind: ErrorKind, setpoint_index: Option<usize>, message: impl fmt::Display) -> Self {
        let reason = if kind == ErrorKind::SafetyLimitExceeded {
            AbortReason::SafetyInterlock
        } else {
            AbortReason::Fault
        };
        Self {
            reason,
            kind,
            setpoint_index,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.reason)?;
        if let Some(index) = self.setpoint_index {
            write!(f, " at setpoint {index}")?;
        }
        Ok(())
    }
}

/// Events emitted during a run, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_uid: String,
        recipe: String,
        setpoints: usize,
    },
    /// A setpoint attempt begins. `attempt` counts from 0 and increases on
    /// setpoint retries and after every pause.
    StartedStep {
        setpoint_index: usize,
        target_temperature: f64,
        attempt: u32,
    },
    StabilityReached {
        setpoint_index: usize,
        temperature: f64,
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },
    StabilityTimeout {
        setpoint_index: usize,
        last_reading: Option<f64>,
        policy: TimeoutPolicy,
        error: EventError,
    },
    InstrumentError {
        setpoint_index: usize,
        policy: AcquisitionErrorPolicy,
        error: EventError,
    },
    SampleAcquired {
        sample: Sample,
    },
    SetpointSkipped {
        setpoint_index: usize,
        reason: String,
    },
    SetpointCompleted {
        setpoint_index: usize,
        samples: usize,
        /// Moving average over completed setpoints.
        #[serde(with = "humantime_serde")]
        average_duration: Duration,
        #[serde(with = "humantime_serde")]
        estimated_remaining: Duration,
    },
    Paused {
        setpoint_index: usize,
    },
    Resumed {
        setpoint_index: usize,
    },
    RunAborted {
        failure: RunFailure,
    },
    RunCompleted {
        samples: usize,
        skipped: usize,
        #[serde(with = "humantime_serde")]
        elapsed: Duration,
    },
}

impl RunEvent {
    /// The snake_case event name, as used in serialized logs.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::StartedStep { .. } => "started_step",
            RunEvent::StabilityReached { .. } => "stability_reached",
            RunEvent::StabilityTimeout { .. } => "stability_timeout",
            RunEvent::InstrumentError { .. } => "instrument_error",
            RunEvent::SampleAcquired { .. } => "sample_acquired",
            RunEvent::SetpointSkipped { .. } => "setpoint_skipped",
            RunEvent::SetpointCompleted { .. } => "setpoint_completed",
            RunEvent::Paused { .. } => "paused",
            RunEvent::Resumed { .. } => "resumed",
            RunEvent::RunAborted { .. } => "run_aborted",
            RunEvent::RunCompleted { .. } => "run_completed",
        }
    }

    pub fn setpoint_index(&self) -> Option<usize> {
        match self {
            RunEvent::StartedStep { setpoint_index, .. }
            | RunEvent::StabilityReached { setpoint_index, .. }
            | RunEvent::StabilityTimeout { setpoint_index, .. }
            | RunEvent::InstrumentError { setpoint_index, .. }
            | RunEvent::SetpointSkipped { setpoint_index, .. }
            | RunEvent::SetpointCompleted { setpoint_index, .. }
            | RunEvent::Paused { setpoint_index }
            | RunEvent::Resumed { setpoint_index } => Some(*setpoint_index),
            RunEvent::SampleAcquired { sample } => Some(sample.setpoint_index),
            RunEvent::RunAborted { failure } => failure.setpoint_index,
            RunEvent::RunStarted { .. } | RunEvent::RunCompleted { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::RunAborted { .. } | RunEvent::RunCompleted { .. })
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Aborting,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// True while a worker owns the hardware.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::Running | RunStatus::Paused | RunStatus::Aborting
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Aborting => "aborting",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the run as published by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub run_uid: Option<String>,
    pub current_setpoint_index: Option<usize>,
    pub retry_count_for_current_step: u32,
    pub samples_emitted: usize,
    pub last_error: Option<RunFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = RunEvent::Paused { setpoint_index: 2 };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"paused","setpoint_index":2}"#);

        let event = RunEvent::StabilityReached {
            setpoint_index: 0,
            temperature: 10.01,
            elapsed: Duration::from_secs(42),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(json["elapsed"], "42s");
    }

    #[test]
    fn test_failure_reason_from_kind() {
        let failure = RunFailure::fault(ErrorKind::SafetyLimitExceeded, Some(1), "too hot");
        assert_eq!(failure.reason, AbortReason::SafetyInterlock);
        assert_eq!(failure.to_string(), "too hot (safety interlock) at setpoint 1");

        let failure = RunFailure::fault(ErrorKind::StabilityTimeout, None, "slow");
        assert_eq!(failure.reason, AbortReason::Fault);

        let failure = RunFailure::operator("user", None);
        assert_eq!(failure.kind, ErrorKind::OperatorAbort);
    }

    #[test]
    fn test_quality_worst() {
        assert_eq!(
            QualityFlag::Normal.worst(QualityFlag::Degraded),
            QualityFlag::Degraded
        );
        assert_eq!(QualityFlag::Normal.worst(QualityFlag::Normal), QualityFlag::Normal);
    }

    #[test]
    fn test_status_predicates() {
        assert!(RunStatus::Paused.is_active());
        assert!(!RunStatus::Idle.is_active());
        assert!(RunStatus::Failed.is_terminal());
        assert_eq!(RunState::default().status, RunStatus::Idle);
    }
}
