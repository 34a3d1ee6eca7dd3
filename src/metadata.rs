//! Run metadata structures and handling.
//!
//! This module defines the `Metadata` struct, which captures the context of a
//! measurement run: who ran it, on which sample, with which instruments. It is
//! carried inside a [`RunRecipe`](crate::experiment::RunRecipe) and written
//! next to the acquired data by the storage sinks, which is crucial for
//! re-analysing temperature sweeps long after they were taken.
//!
//! ## Fields
//!
//! - **`sample_id`**: Identifier of the specimen mounted in the cryostat.
//! - **`operator`**: Who started the run.
//! - **`description`**: Free-text description of the run's purpose.
//! - **`cryostat`**: Which cooler the sample sat in.
//! - **`instrument_config`**: Snapshot of the instrument setup (addresses, ranges).
//! - **`parameters`**: User-defined key-value parameters (contact geometry, etc.).
//! - **`software_version`**: Automatically captures the version of this software.
//!
//! A `MetadataBuilder` is provided for ergonomic construction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Captures the context of a measurement run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Metadata {
    /// Identifier of the mounted sample.
    pub sample_id: String,
    /// Operator who configured the run.
    pub operator: String,
    /// A detailed description of the run.
    pub description: String,
    /// Cryostat or cold head the sample was mounted in.
    pub cryostat: String,
    /// Version of the acquisition software.
    pub software_version: String,
    /// Configuration of the instruments used.
    pub instrument_config: BTreeMap<String, String>,
    /// User-defined experimental parameters.
    pub parameters: BTreeMap<String, String>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            sample_id: String::new(),
            operator: String::new(),
            description: String::new(),
            cryostat: String::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            instrument_config: BTreeMap::new(),
            parameters: BTreeMap::new(),
        }
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_id(mut self, sample_id: &str) -> Self {
        self.inner.sample_id = sample_id.to_string();
        self
    }

    pub fn operator(mut self, operator: &str) -> Self {
        self.inner.operator = operator.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.inner.description = description.to_string();
        self
    }

    pub fn instrument_config(mut self, key: &str, value: &str) -> Self {
        self.inner
            .instrument_config
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn parameter(mut self, key: &str, value: &str) -> Self {
        self.inner
            .parameters
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn cryostat(mut self, cryostat: &str) -> Self {
        self.inner.cryostat = cryostat.to_string();
        self
    }

    pub fn build(self) -> Metadata {
        self.inner
    }
}

impl Metadata {
    /// Renders the metadata as pretty JSON lines for file headers.
    pub fn header_lines(&self) -> serde_json::Result<Vec<String>> {
        let json = serde_json::to_string_pretty(self)?;
        Ok(json.lines().map(str::to_string).collect())
    }
}
