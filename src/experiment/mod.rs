//! Measurement run orchestration
//!
//! This module provides the RunEngine that sequences temperature setpoints,
//! waits for thermal stability and acquires resistance samples, with
//! pause/resume/abort control and a guaranteed safe state at the end.
//!
//! # Architecture
//!
//! - **Recipe**: declarative run definition (setpoints, excitations, policies, limits)
//! - **StabilityMonitor**: sliding-window settle detection per setpoint
//! - **AcquisitionLoop**: excitation sweep, retries and reduction per setpoint
//! - **Calibration / I-V curve**: excitation ramps outside of a run
//! - **RunEngine**: state machine that executes a recipe on a worker task
//! - **Documents**: samples and the ordered run event stream
//!
//! # Example
//!
//! ```rust,ignore
//! use resistance_daq::experiment::{RunEngine, RunRecipe, SetpointSpec};
//!
//! let recipe = RunRecipe::new("cooldown")
//!     .with_setpoint(SetpointSpec::new(300.0, settle, max_wait).with_source_values(&[1e-4]))
//!     .with_setpoint(SetpointSpec::new(250.0, settle, max_wait).with_source_values(&[1e-4]));
//!
//! let engine = RunEngine::new(hardware, sink, config);
//! engine.start(&recipe)?;
//!
//! // Can pause/resume between suspension points
//! engine.pause()?;
//! engine.resume()?;
//! ```

pub mod acquisition;
pub mod calibration;
pub mod control;
pub mod document;
pub mod iv_curve;
pub mod recipe;
pub mod reduction;
pub mod run_engine;
pub mod stability;

pub use acquisition::{AcquisitionLoop, SetpointContext};
pub use calibration::{CalibrationParams, CalibrationResult, CalibrationStep, ExcitationCalibration};
pub use control::{ControlReceiver, ControlSignal, Interrupt, RunControl};
pub use document::{
    AbortReason, EventError, QualityFlag, RunEvent, RunFailure, RunState, RunStatus, Sample,
};
pub use iv_curve::{IvCurve, IvCurveParams, IvPoint};
pub use recipe::{
    AcquisitionErrorPolicy, RampProgram, RampStage, RunPolicy, RunRecipe, SafetyLimits,
    SetpointMode, SetpointSpec, TimeoutPolicy,
};
pub use reduction::{Reduction, ReductionMethod};
pub use run_engine::RunEngine;
pub use stability::{Clock, StabilityMonitor, StableReading, TokioClock};
