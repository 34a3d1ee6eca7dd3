//! Core library for the resistance_daq application.
//!
//! This library sequences temperature setpoints on a cryostat, waits for the
//! sample temperature to settle, drives a source meter / nanovoltmeter pair
//! through the configured excitation levels and hands every reduced
//! resistance sample to a data sink. It is used by the CLI binary and can be
//! embedded in any host interface.
//!
//! # Data Flow
//!
//! ```text
//! RunRecipe --> RunEngine (worker task)
//!                  │
//!                  ├── StabilityMonitor ── TemperatureController
//!                  ├── AcquisitionLoop ─── SourceMeter
//!                  │
//!                  └── Sample / RunEvent ──> DataSink + broadcast subscribers
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod hardware;
pub mod metadata;

pub use config::EngineConfig;
pub use data::storage::{DataSink, EventLog, MemorySink, SharedSink};
pub use error::{AcquisitionError, AdapterError, ErrorKind, RunError, StabilityError};
pub use experiment::{
    QualityFlag, RunEngine, RunEvent, RunRecipe, RunState, RunStatus, Sample, SetpointSpec,
};
pub use hardware::{HardwareSet, SourceMeter, TemperatureController};
