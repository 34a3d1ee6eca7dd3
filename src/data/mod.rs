//! Data sinks for run output.

pub mod storage;
