//! Data sinks with clean feature flag handling.
//!
//! A [`DataSink`] receives every sample and every run event, synchronously,
//! from the run worker. Sinks must not block for long: slow backends go
//! behind a [`BufferedSink`], which hands records to a writer task.
//!
//! Write failures do not stop a run. A sink keeps the first error it hits and
//! reports it from [`DataSink::flush`], which the engine calls once the run
//! reaches a terminal state.
use crate::experiment::document::{RunEvent, Sample};
use crate::experiment::iv_curve::IvPoint;
use crate::metadata::Metadata;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Receiver of run output.
pub trait DataSink: Send {
    fn on_sample(&mut self, sample: Sample);

    fn on_event(&mut self, event: RunEvent);

    /// Flushes buffered output and reports the first write error, if any.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The form in which the engine holds its sink.
pub type SharedSink = Arc<Mutex<dyn DataSink>>;

/// Wraps a sink for sharing, keeping its concrete type for the caller.
pub fn shared<S: DataSink + 'static>(sink: S) -> Arc<Mutex<S>> {
    Arc::new(Mutex::new(sink))
}

// ============================================================================
// In-memory sink and event log
// ============================================================================

/// An event with its position in the run's log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LoggedEvent {
    pub seq: u64,
    pub received: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Ordered log of run events. Samples are ignored.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<LoggedEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: RunEvent) {
        let seq = self.events.len() as u64;
        self.events.push(LoggedEvent {
            seq,
            received: Utc::now(),
            event,
        });
    }

    pub fn events(&self) -> &[LoggedEvent] {
        &self.events
    }

    /// Event names in log order.
    pub fn names(&self) -> Vec<&'static str> {
        self.events.iter().map(|e| e.event.name()).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.iter().filter(|e| e.event.name() == name).count()
    }

    /// JSON lines, one event per line.
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl DataSink for EventLog {
    fn on_sample(&mut self, _sample: Sample) {}

    fn on_event(&mut self, event: RunEvent) {
        self.push(event);
    }
}

/// Keeps samples and the event log in memory. Used by tests and embedding
/// hosts.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Vec<Sample>,
    log: EventLog,
    flushes: u32,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn events(&self) -> &[LoggedEvent] {
        self.log.events()
    }

    /// Event names in log order.
    pub fn event_names(&self) -> Vec<&'static str> {
        self.log.names()
    }

    pub fn count(&self, name: &str) -> usize {
        self.log.count(name)
    }

    pub fn flushes(&self) -> u32 {
        self.flushes
    }
}

impl DataSink for MemorySink {
    fn on_sample(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    fn on_event(&mut self, event: RunEvent) {
        self.log.push(event);
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

// ============================================================================
// Tracing sink
// ============================================================================

/// Logs samples and events through `tracing` only.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DataSink for TracingSink {
    fn on_sample(&mut self, sample: Sample) {
        info!(
            setpoint = sample.setpoint_index,
            excitation = sample.excitation_value,
            temperature = sample.measured_temperature,
            resistance = sample.derived_resistance,
            quality = %sample.quality_flag,
            "Sample"
        );
    }

    fn on_event(&mut self, event: RunEvent) {
        match &event {
            RunEvent::SampleAcquired { .. } => {}
            RunEvent::StabilityTimeout { error, .. } | RunEvent::InstrumentError { error, .. } => {
                warn!(event = event.name(), kind = %error.kind, "{}", error.message);
            }
            RunEvent::RunAborted { failure } => {
                error!(kind = %failure.kind, "Run aborted: {}", failure);
            }
            other => info!(event = other.name(), setpoint = ?other.setpoint_index(), "Run event"),
        }
    }
}

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::io::{BufWriter, Write};
    use std::path::{Path, PathBuf};

    const HEADER: [&str; 10] = [
        "setpoint_index",
        "excitation_index",
        "timestamp",
        "measured_temperature",
        "excitation_value",
        "measured_response",
        "derived_resistance",
        "resistance_spread",
        "readings",
        "quality_flag",
    ];

    /// Samples as CSV with a commented JSON metadata header, events as JSON
    /// lines in a sidecar file (`<name>.events.jsonl`).
    pub struct CsvSink {
        path: PathBuf,
        writer: csv::Writer<File>,
        events: BufWriter<File>,
        error: Option<anyhow::Error>,
    }

    impl CsvSink {
        /// Creates `<dir>/<name>_<timestamp>.csv` and its event log.
        pub fn create(dir: &Path, name: &str, metadata: &Metadata) -> Result<Self> {
            if !dir.exists() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create storage directory at {:?}", dir))?;
            }
            let stem: String = name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
                .collect();
            let file_name = format!("{}_{}.csv", stem, Utc::now().format("%Y%m%d_%H%M%S"));
            Self::create_at(&dir.join(file_name), metadata)
        }

        pub fn create_at(path: &Path, metadata: &Metadata) -> Result<Self> {
            let mut file = File::create(path)
                .with_context(|| format!("Failed to create CSV file at {:?}", path))?;

            let lines = metadata
                .header_lines()
                .context("Failed to serialize metadata to JSON")?;
            for line in lines {
                file.write_all(b"# ")
                    .and_then(|_| file.write_all(line.as_bytes()))
                    .and_then(|_| file.write_all(b"\n"))
                    .context("Failed to write metadata to CSV file")?;
            }

            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            writer
                .write_record(HEADER)
                .context("Failed to write CSV header")?;

            let events_path = path.with_extension("events.jsonl");
            let events = File::create(&events_path)
                .with_context(|| format!("Failed to create event log at {:?}", events_path))?;

            info!("CSV sink writing to '{}'.", path.display());
            Ok(Self {
                path: path.to_path_buf(),
                writer,
                events: BufWriter::new(events),
                error: None,
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn events_path(&self) -> PathBuf {
            self.path.with_extension("events.jsonl")
        }

        fn record(&mut self, result: Result<()>) {
            if let Err(e) = result {
                if self.error.is_none() {
                    error!("CSV sink write failed: {:#}", e);
                    self.error = Some(e);
                }
            }
        }

        fn write_event(&mut self, event: &RunEvent) -> Result<()> {
            serde_json::to_writer(&mut self.events, event)
                .context("Failed to serialize event")?;
            self.events
                .write_all(b"\n")
                .context("Failed to write event log")
        }
    }

    /// Writes an I-V curve, one row per point, with a header row.
    pub fn write_iv_curve(path: &Path, points: &[IvPoint]) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create CSV file at {:?}", path))?;
        for point in points {
            writer
                .serialize(point)
                .context("Failed to write I-V point to CSV file")?;
        }
        writer.flush().context("Failed to flush CSV writer")?;
        info!(points = points.len(), "I-V curve written to '{}'.", path.display());
        Ok(())
    }

    impl DataSink for CsvSink {
        fn on_sample(&mut self, sample: Sample) {
            let result = self
                .writer
                .serialize(&sample)
                .context("Failed to write sample to CSV file");
            self.record(result);
        }

        fn on_event(&mut self, event: RunEvent) {
            let result = self.write_event(&event);
            self.record(result);
        }

        fn flush(&mut self) -> Result<()> {
            let result = self
                .writer
                .flush()
                .context("Failed to flush CSV writer")
                .and_then(|_| self.events.flush().context("Failed to flush event log"));
            self.record(result);
            match self.error.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use std::path::Path;

    pub struct CsvSink;

    impl CsvSink {
        pub fn create(_dir: &Path, _name: &str, _metadata: &Metadata) -> Result<Self> {
            anyhow::bail!("Feature not enabled: storage_csv")
        }

        pub fn create_at(_path: &Path, _metadata: &Metadata) -> Result<Self> {
            anyhow::bail!("Feature not enabled: storage_csv")
        }
    }

    pub fn write_iv_curve(_path: &Path, _points: &[IvPoint]) -> Result<()> {
        anyhow::bail!("Feature not enabled: storage_csv")
    }

    impl DataSink for CsvSink {
        fn on_sample(&mut self, _sample: Sample) {}

        fn on_event(&mut self, _event: RunEvent) {}
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{write_iv_curve, CsvSink};

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::{write_iv_curve, CsvSink};

// ============================================================================
// Buffered sink
// ============================================================================

enum Record {
    Sample(Sample),
    Event(RunEvent),
    Flush,
}

/// Forwards records to a writer task that owns the inner sink.
///
/// The run worker never waits on the inner sink. Call
/// [`shutdown`](Self::shutdown) and await the returned handle to drain it.
pub struct BufferedSink {
    tx: Option<mpsc::UnboundedSender<Record>>,
    writer: Option<JoinHandle<Result<()>>>,
}

impl BufferedSink {
    /// Spawns the writer task. Must be called inside a tokio runtime.
    pub fn spawn<S: DataSink + 'static>(mut inner: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(async move {
            let mut first_error = None;
            while let Some(record) = rx.recv().await {
                match record {
                    Record::Sample(sample) => inner.on_sample(sample),
                    Record::Event(event) => inner.on_event(event),
                    Record::Flush => {
                        if let Err(e) = inner.flush() {
                            first_error.get_or_insert(e);
                        }
                    }
                }
            }
            let result = inner.flush();
            match first_error {
                Some(e) => Err(e),
                None => result,
            }
        });
        Self {
            tx: Some(tx),
            writer: Some(writer),
        }
    }

    fn send(&mut self, record: Record) {
        let delivered = match &self.tx {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        };
        if !delivered {
            warn!("Buffered sink closed, record dropped");
        }
    }

    /// Closes the queue. The returned task finishes once everything queued
    /// has been written.
    pub fn shutdown(&mut self) -> Option<JoinHandle<Result<()>>> {
        self.tx = None;
        self.writer.take()
    }
}

impl DataSink for BufferedSink {
    fn on_sample(&mut self, sample: Sample) {
        self.send(Record::Sample(sample));
    }

    fn on_event(&mut self, event: RunEvent) {
        self.send(Record::Event(event));
    }

    /// Queues a flush of the inner sink; errors surface from `shutdown`.
    fn flush(&mut self) -> Result<()> {
        if self.tx.is_some() {
            self.send(Record::Flush);
        }
        Ok(())
    }
}
