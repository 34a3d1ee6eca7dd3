//! RunEngine - Run State Machine for temperature sweeps
//!
//! The engine is the host-facing handle. `start()` takes the hardware lock,
//! spawns a worker task and returns immediately; the worker walks the recipe
//! one setpoint at a time:
//!
//! ```text
//! for each setpoint:
//!     honour pause ── StartedStep ── StabilityMonitor ── AcquisitionLoop
//!                                        │                    │
//!                                   timeout policy     instrument error policy
//!     emit samples ── SetpointCompleted
//! safe state ── release lock ── RunCompleted | RunAborted
//! ```
//!
//! Control requests (`pause`, `resume`, `abort`) are forwarded over a watch
//! channel and observed at every suspension point. A pause interrupts the
//! current setpoint; after `resume()` it starts again from the stability
//! wait. Samples of a settled setpoint are only emitted once the whole
//! setpoint has been acquired. Sweep setpoints skip the stability wait and
//! publish each pass over the excitations as it finishes, until the
//! temperature arrives at the target.
//!
//! Every run ends with exactly one terminal event and one
//! `zero_and_disable()` on the source.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = RunEngine::new(hardware, sink, Arc::new(EngineConfig::default()));
//! let mut events = engine.subscribe();
//!
//! let run_uid = engine.start(&recipe)?;
//! engine.pause()?;
//! engine.resume()?;
//! let state = engine.wait().await;
//! ```

use crate::config::EngineConfig;
use crate::data::storage::SharedSink;
use crate::error::{AcquisitionError, RunError, StabilityError};
use crate::experiment::acquisition::{AcquisitionLoop, SetpointContext};
use crate::experiment::calibration::{CalibrationParams, CalibrationResult, ExcitationCalibration};
use crate::experiment::control::{self, ControlReceiver, Interrupt, RunControl};
use crate::experiment::iv_curve::{IvCurve, IvCurveParams, IvPoint};
use crate::experiment::document::{
    new_uid, EventError, QualityFlag, RunEvent, RunFailure, RunState, RunStatus, Sample,
};
use crate::experiment::recipe::{
    AcquisitionErrorPolicy, RunRecipe, SafetyLimits, SetpointMode, SetpointSpec, TimeoutPolicy,
};
use crate::experiment::stability::{Clock, StabilityMonitor, TokioClock};
use crate::hardware::{HardwareLease, HardwareSet, SourceMeter};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// Completed setpoints averaged for the ETA.
const ETA_WINDOW: usize = 5;

/// Host handle for runs on one hardware set.
pub struct RunEngine {
    hardware: HardwareSet,
    sink: SharedSink,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<RunEvent>,
    state: Arc<watch::Sender<RunState>>,
    control: Mutex<Option<RunControl>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RunEngine {
    pub fn new(hardware: HardwareSet, sink: SharedSink, config: Arc<EngineConfig>) -> Self {
        let (events, _) = broadcast::channel(config.application.event_capacity.max(1));
        let (state, _) = watch::channel(RunState::default());
        Self {
            hardware,
            sink,
            config,
            clock: Arc::new(TokioClock),
            events,
            state: Arc::new(state),
            control: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Replaces the clock used for elapsed times and ETAs.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Receives every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Calls `listener` for every event on a forwarding task.
    ///
    /// The task ends when the engine is dropped.
    pub fn add_listener<F>(&self, mut listener: F) -> JoinHandle<()>
    where
        F: FnMut(RunEvent) + Send + 'static,
    {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => listener(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event listener lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Current run snapshot.
    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Validates `recipe`, takes the hardware lock and starts the worker.
    ///
    /// Returns the new run's UID. Fails fast with `HardwareBusy` when another
    /// run (from any engine) holds the hardware set.
    pub fn start(&self, recipe: &RunRecipe) -> Result<String, RunError> {
        recipe.validate().map_err(RunError::InvalidRecipe)?;
        let lease = self.hardware.try_acquire()?;

        let run_uid = new_uid();
        let (handle, receiver) = control::channel();
        *self.control.lock() = Some(handle);
        self.state.send_replace(RunState {
            status: RunStatus::Running,
            run_uid: Some(run_uid.clone()),
            ..RunState::default()
        });

        let reduction = recipe.reduction.unwrap_or(self.config.acquisition.reduction);
        let retry = self.config.acquisition.retry.clone();
        let alarm_threshold = self.config.safety.alarm_threshold;
        let worker = Worker {
            recipe: recipe.clone(),
            run_uid: run_uid.clone(),
            lease,
            control: receiver,
            monitor: StabilityMonitor::new(
                self.config.stability.clone(),
                retry.clone(),
                recipe.safety,
                alarm_threshold,
            )
            .with_clock(self.clock.clone()),
            acquisition: AcquisitionLoop::new(retry, recipe.safety, alarm_threshold, reduction.build()),
            reporter: Reporter {
                run_uid: run_uid.clone(),
                sink: self.sink.clone(),
                events: self.events.clone(),
                state: self.state.clone(),
            },
            clock: self.clock.clone(),
            safe_state_timeout: self.config.safety.safe_state_timeout,
        };

        info!(run_uid = %run_uid, recipe = %recipe.name, setpoints = recipe.setpoints.len(), "Starting run");
        let span = info_span!("run", run_uid = %run_uid);
        let task = tokio::spawn(worker.run().instrument(span));
        if let Some(previous) = self.worker.lock().replace(task) {
            if !previous.is_finished() {
                warn!("Previous run worker still finishing");
            }
        }
        Ok(run_uid)
    }

    /// Requests a pause. The worker parks at its next suspension point.
    pub fn pause(&self) -> Result<(), RunError> {
        let status = self.state().status;
        let control = self.control.lock();
        match control.as_ref() {
            Some(c) if status == RunStatus::Running && c.pause() => {
                info!("Pause requested");
                Ok(())
            }
            _ => Err(RunError::InvalidState(status.to_string())),
        }
    }

    /// Releases a pause. The interrupted setpoint restarts from its
    /// stability wait.
    pub fn resume(&self) -> Result<(), RunError> {
        let status = self.state().status;
        let control = self.control.lock();
        match control.as_ref() {
            Some(c) if status.is_active() && c.resume() => {
                info!("Resume requested");
                Ok(())
            }
            _ => Err(RunError::InvalidState(status.to_string())),
        }
    }

    /// Requests an abort. Idempotent: later calls keep the first reason, and
    /// calls without an active run do nothing.
    pub fn abort(&self, reason: &str) {
        if let Some(control) = self.control.lock().as_ref() {
            if control.abort(reason) {
                info!(reason, "Abort requested");
            }
        }
    }

    /// Waits for the current worker to exit and returns the final state.
    pub async fn wait(&self) -> RunState {
        let task = self.worker.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Run worker failed: {}", e);
            }
        }
        self.state()
    }

    /// Waits until the published status equals `status`.
    pub async fn wait_for_status(&self, status: RunStatus) -> RunState {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(|state| state.status == status).await;
        match result {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Runs the excitation calibration under the hardware lock.
    ///
    /// Can be cancelled with [`abort`](Self::abort). The source is zeroed and
    /// disabled afterwards whatever the outcome.
    pub async fn calibrate(
        &self,
        params: CalibrationParams,
        limits: SafetyLimits,
    ) -> Result<CalibrationResult, RunError> {
        let mut lease = self.hardware.try_acquire()?;
        let (handle, mut receiver) = control::channel();
        *self.control.lock() = Some(handle);

        let calibration =
            ExcitationCalibration::new(params, self.config.acquisition.retry.clone(), limits);
        let result = calibration
            .run(lease.source.as_mut(), &mut receiver)
            .instrument(info_span!("calibration"))
            .await;
        restore_safe_state(lease.source.as_mut(), self.config.safety.safe_state_timeout).await;

        match &result {
            Ok(r) => info!(excitation = r.excitation, resistance = r.resistance, "Calibration finished"),
            Err(e) => error!("{}", e),
        }
        result
    }

    /// Records an I-V curve under the hardware lock.
    ///
    /// Cancelled with [`abort`](Self::abort) like a calibration, and the
    /// source is zeroed and disabled afterwards whatever the outcome.
    pub async fn iv_curve(
        &self,
        params: IvCurveParams,
        limits: SafetyLimits,
    ) -> Result<Vec<IvPoint>, RunError> {
        let mut lease = self.hardware.try_acquire()?;
        let (handle, mut receiver) = control::channel();
        *self.control.lock() = Some(handle);

        let curve = IvCurve::new(params, self.config.acquisition.retry.clone(), limits);
        let result = curve
            .run(&mut lease, &mut receiver)
            .instrument(info_span!("iv_curve"))
            .await;
        restore_safe_state(lease.source.as_mut(), self.config.safety.safe_state_timeout).await;

        if let Err(e) = &result {
            error!("{}", e);
        }
        result
    }
}

/// Zeroes and disables the source, bounded by `timeout`. Failures are
/// logged; there is nothing left to escalate to.
async fn restore_safe_state(source: &mut dyn SourceMeter, timeout: Duration) {
    match tokio::time::timeout(timeout, source.zero_and_disable()).await {
        Ok(Ok(())) => info!(source = source.id(), "Source zeroed and disabled"),
        Ok(Err(e)) => error!(source = source.id(), error = %e, "zero_and_disable failed"),
        Err(_) => error!(source = source.id(), ?timeout, "zero_and_disable timed out"),
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Publishes events, samples and state from the worker.
struct Reporter {
    run_uid: String,
    sink: SharedSink,
    events: broadcast::Sender<RunEvent>,
    state: Arc<watch::Sender<RunState>>,
}

impl Reporter {
    fn emit(&self, event: RunEvent) {
        self.sink.lock().on_event(event.clone());
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn sample(&self, sample: Sample) {
        self.sink.lock().on_sample(sample.clone());
        self.emit(RunEvent::SampleAcquired { sample });
        self.update(|s| s.samples_emitted += 1);
    }

    /// Applies `f` while the published state still belongs to this run.
    /// Once a newer run has started, a finishing worker writes nothing.
    fn update(&self, f: impl FnOnce(&mut RunState)) {
        self.state.send_if_modified(|state| {
            if state.run_uid.as_deref() != Some(self.run_uid.as_str()) {
                return false;
            }
            f(state);
            true
        });
    }

    fn flush(&self) {
        if let Err(e) = self.sink.lock().flush() {
            error!("Data sink flush failed: {:#}", e);
        }
    }
}

enum StepOutcome {
    Completed(Vec<Sample>),
    Skipped(String),
    Retry,
}

enum TimeoutOutcome {
    Skip(String),
    /// Carries the last reading, if any.
    Proceed(Option<f64>),
}

enum StepFailure {
    Interrupted(Interrupt),
    Fatal(RunFailure),
}

struct RunSummary {
    samples: usize,
    skipped: usize,
}

struct Worker {
    recipe: RunRecipe,
    run_uid: String,
    lease: HardwareLease,
    control: ControlReceiver,
    monitor: StabilityMonitor,
    acquisition: AcquisitionLoop,
    reporter: Reporter,
    clock: Arc<dyn Clock>,
    safe_state_timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        let started = self.clock.now();
        self.reporter.emit(RunEvent::RunStarted {
            run_uid: self.run_uid.clone(),
            recipe: self.recipe.name.clone(),
            setpoints: self.recipe.setpoints.len(),
        });

        let outcome = self.execute().await;
        if let Err(failure) = &outcome {
            error!(kind = %failure.kind, "Run failed: {}", failure);
            let failure = failure.clone();
            self.reporter.update(|s| {
                s.status = RunStatus::Aborting;
                s.last_error = Some(failure);
            });
        }

        restore_safe_state(self.lease.source.as_mut(), self.safe_state_timeout).await;
        let elapsed = self.clock.now().saturating_duration_since(started);
        let Worker { lease, reporter, .. } = self;

        let (status, terminal) = match outcome {
            Ok(summary) => {
                info!(samples = summary.samples, skipped = summary.skipped, ?elapsed, "Run completed");
                let event = RunEvent::RunCompleted {
                    samples: summary.samples,
                    skipped: summary.skipped,
                    elapsed,
                };
                (RunStatus::Completed, event)
            }
            Err(failure) => (RunStatus::Failed, RunEvent::RunAborted { failure }),
        };

        // terminal state and event are published only after the lease is released
        drop(lease);
        reporter.update(|s| {
            s.status = status;
            s.current_setpoint_index = None;
        });
        reporter.emit(terminal);
        reporter.flush();
    }

    async fn execute(&mut self) -> Result<RunSummary, RunFailure> {
        let total = self.recipe.setpoints.len();
        let mut summary = RunSummary {
            samples: 0,
            skipped: 0,
        };
        let mut durations: VecDeque<Duration> = VecDeque::with_capacity(ETA_WINDOW);

        for index in 0..total {
            let setpoint = self.recipe.setpoints[index].clone();
            self.reporter.update(|s| {
                s.current_setpoint_index = Some(index);
                s.retry_count_for_current_step = 0;
            });
            let step_started = self.clock.now();
            let mut attempt = 0u32;
            let mut retries = 0u32;
            // sweep samples already published for this setpoint
            let mut swept = 0usize;

            loop {
                self.honour_pause(index).await?;
                self.reporter.emit(RunEvent::StartedStep {
                    setpoint_index: index,
                    target_temperature: setpoint.target_temperature,
                    attempt,
                });

                let span = info_span!("setpoint", setpoint = index, attempt);
                let result = match setpoint.mode {
                    SetpointMode::Settle => {
                        self.run_setpoint(index, &setpoint, retries).instrument(span).await
                    }
                    SetpointMode::Sweep => {
                        self.run_sweep(index, &setpoint, retries, &mut swept)
                            .instrument(span)
                            .await
                    }
                };
                attempt += 1;

                match result {
                    Ok(StepOutcome::Completed(samples)) => {
                        let count = swept + samples.len();
                        for sample in samples {
                            self.reporter.sample(sample);
                        }
                        summary.samples += count;

                        if durations.len() == ETA_WINDOW {
                            durations.pop_front();
                        }
                        durations.push_back(self.clock.now().saturating_duration_since(step_started));
                        let average = durations.iter().sum::<Duration>() / durations.len() as u32;
                        let remaining = (total - index - 1) as u32;
                        self.reporter.emit(RunEvent::SetpointCompleted {
                            setpoint_index: index,
                            samples: count,
                            average_duration: average,
                            estimated_remaining: average * remaining,
                        });
                        break;
                    }
                    Ok(StepOutcome::Skipped(reason)) => {
                        warn!(setpoint = index, "Skipping setpoint: {}", reason);
                        summary.samples += swept;
                        summary.skipped += 1;
                        self.reporter.emit(RunEvent::SetpointSkipped {
                            setpoint_index: index,
                            reason,
                        });
                        break;
                    }
                    Ok(StepOutcome::Retry) => {
                        retries += 1;
                        self.reporter.update(|s| s.retry_count_for_current_step = retries);
                        info!(setpoint = index, retries, "Retrying setpoint");
                    }
                    // Paused: park at the top of the loop, then restart the setpoint
                    Err(StepFailure::Interrupted(Interrupt::Pause)) => {}
                    Err(StepFailure::Interrupted(Interrupt::Abort(reason))) => {
                        return Err(RunFailure::operator(&reason, Some(index)));
                    }
                    Err(StepFailure::Fatal(failure)) => return Err(failure),
                }
            }
        }
        Ok(summary)
    }

    /// Parks while paused. Publishes `Paused`/`Resumed` around the wait.
    async fn honour_pause(&mut self, index: usize) -> Result<(), RunFailure> {
        match self.control.check() {
            Ok(()) => return Ok(()),
            Err(Interrupt::Abort(reason)) => return Err(RunFailure::operator(&reason, Some(index))),
            Err(Interrupt::Pause) => {}
        }

        info!(setpoint = index, "Run paused");
        self.reporter.update(|s| s.status = RunStatus::Paused);
        self.reporter.emit(RunEvent::Paused {
            setpoint_index: index,
        });

        match self.control.resumed().await {
            Ok(()) => {
                info!(setpoint = index, "Run resumed");
                self.reporter.update(|s| s.status = RunStatus::Running);
                self.reporter.emit(RunEvent::Resumed {
                    setpoint_index: index,
                });
                Ok(())
            }
            Err(Interrupt::Abort(reason)) => Err(RunFailure::operator(&reason, Some(index))),
            Err(Interrupt::Pause) => Err(RunFailure::operator("paused run lost control", Some(index))),
        }
    }

    async fn run_setpoint(
        &mut self,
        index: usize,
        setpoint: &SetpointSpec,
        retries: u32,
    ) -> Result<StepOutcome, StepFailure> {
        let stability = self
            .monitor
            .await_stability(setpoint, self.lease.controller.as_mut(), &mut self.control)
            .await;
        let (stable_temperature, baseline_quality) = match stability {
            Ok(reading) => {
                self.reporter.emit(RunEvent::StabilityReached {
                    setpoint_index: index,
                    temperature: reading.temperature,
                    elapsed: reading.elapsed,
                });
                (reading.temperature, QualityFlag::Normal)
            }
            Err(e @ StabilityError::Timeout { .. }) => match self.stability_timeout(index, e)? {
                TimeoutOutcome::Skip(reason) => return Ok(StepOutcome::Skipped(reason)),
                TimeoutOutcome::Proceed(last_reading) => (
                    last_reading.unwrap_or(setpoint.target_temperature),
                    QualityFlag::Degraded,
                ),
            },
            Err(e) => return Err(stability_failure(index, e)),
        };

        let context = SetpointContext {
            setpoint_index: index,
            stable_temperature,
            baseline_quality,
        };
        let acquired = self
            .acquisition
            .acquire(context, setpoint, &mut self.lease, &mut self.control)
            .await;
        match acquired {
            Ok(samples) => Ok(StepOutcome::Completed(samples)),
            Err(e) => self.acquisition_failure(index, e, retries),
        }
    }

    /// Measures while the temperature moves to the target.
    ///
    /// Every pass polls the temperature and then measures each excitation
    /// once; samples are published as soon as a pass finishes and counted in
    /// `swept`. The setpoint completes once a poll lands in the tolerance
    /// band. A restart after a pause or retry keeps what was published.
    async fn run_sweep(
        &mut self,
        index: usize,
        setpoint: &SetpointSpec,
        retries: u32,
        swept: &mut usize,
    ) -> Result<StepOutcome, StepFailure> {
        let target = setpoint.target_temperature;
        let tolerance = self.monitor.tolerance(setpoint);
        self.monitor
            .command(setpoint, self.lease.controller.as_mut(), &mut self.control)
            .await
            .map_err(|e| stability_failure(index, e))?;
        info!(target_temperature = target, tolerance, interval = ?setpoint.sample_interval, "Sweeping");

        let started = self.clock.now();
        let mut failures = 0;
        let mut last_reading = None;
        let mut passes = 0u32;

        loop {
            if let Err(interrupt) = self.control.check() {
                return Err(StepFailure::Interrupted(interrupt));
            }
            let polled = self
                .monitor
                .poll(self.lease.controller.as_mut(), &mut self.control, &mut failures)
                .await
                .map_err(|e| stability_failure(index, e))?;
            if polled.is_some() {
                last_reading = polled;
            }

            let context = SetpointContext {
                setpoint_index: index,
                stable_temperature: last_reading.unwrap_or(target),
                baseline_quality: QualityFlag::Normal,
            };
            let acquired = self
                .acquisition
                .acquire(context, setpoint, &mut self.lease, &mut self.control)
                .await;
            match acquired {
                Ok(samples) => {
                    *swept += samples.len();
                    for sample in samples {
                        self.reporter.sample(sample);
                    }
                }
                Err(e) => return self.acquisition_failure(index, e, retries),
            }
            passes += 1;

            let waited = self.clock.now().saturating_duration_since(started);
            if let Some(temperature) = polled {
                if (temperature - target).abs() <= tolerance {
                    info!(target_temperature = target, temperature, passes, ?waited, "Sweep reached target");
                    return Ok(StepOutcome::Completed(Vec::new()));
                }
            }
            if waited > setpoint.max_settle_wait {
                warn!(target_temperature = target, ?waited, ?last_reading, "Sweep did not reach target");
                let e = StabilityError::Timeout {
                    target,
                    waited,
                    last_reading,
                };
                return match self.stability_timeout(index, e)? {
                    TimeoutOutcome::Skip(reason) => Ok(StepOutcome::Skipped(reason)),
                    TimeoutOutcome::Proceed(_) => Ok(StepOutcome::Completed(Vec::new())),
                };
            }

            if let Err(interrupt) = self.control.sleep(setpoint.sample_interval).await {
                return Err(StepFailure::Interrupted(interrupt));
            }
        }
    }

    /// Publishes `StabilityTimeout` and applies the recipe's timeout policy.
    fn stability_timeout(
        &self,
        index: usize,
        e: StabilityError,
    ) -> Result<TimeoutOutcome, StepFailure> {
        let on_timeout = self.recipe.policy.on_timeout;
        let last_reading = match &e {
            StabilityError::Timeout { last_reading, .. } => *last_reading,
            _ => None,
        };
        warn!(setpoint = index, policy = ?on_timeout, "{}", e);
        self.reporter.emit(RunEvent::StabilityTimeout {
            setpoint_index: index,
            last_reading,
            policy: on_timeout,
            error: EventError::new(e.kind(), &e),
        });
        match on_timeout {
            TimeoutPolicy::Abort => Err(StepFailure::Fatal(fatal_stability(index, e))),
            TimeoutPolicy::Skip => Ok(TimeoutOutcome::Skip(e.to_string())),
            TimeoutPolicy::ProceedAnyway => Ok(TimeoutOutcome::Proceed(last_reading)),
        }
    }

    /// Applies the recipe's acquisition error policy.
    fn acquisition_failure(
        &self,
        index: usize,
        e: AcquisitionError,
        retries: u32,
    ) -> Result<StepOutcome, StepFailure> {
        match e {
            AcquisitionError::Interrupted(interrupt) => Err(StepFailure::Interrupted(interrupt)),
            e @ AcquisitionError::SafetyLimitExceeded(_) => {
                Err(StepFailure::Fatal(fatal_acquisition(index, e)))
            }
            e @ AcquisitionError::InstrumentFault { .. } => {
                let on_error = self.recipe.policy.on_acquisition_error;
                warn!(setpoint = index, policy = ?on_error, "{}", e);
                self.reporter.emit(RunEvent::InstrumentError {
                    setpoint_index: index,
                    policy: on_error,
                    error: EventError::new(e.kind(), &e),
                });
                match on_error {
                    AcquisitionErrorPolicy::AbortRun => {
                        Err(StepFailure::Fatal(fatal_acquisition(index, e)))
                    }
                    AcquisitionErrorPolicy::SkipSetpoint => Ok(StepOutcome::Skipped(e.to_string())),
                    AcquisitionErrorPolicy::RetrySetpoint { max_retries } if retries < max_retries => {
                        Ok(StepOutcome::Retry)
                    }
                    AcquisitionErrorPolicy::RetrySetpoint { max_retries } => Ok(StepOutcome::Skipped(
                        format!("{} (gave up after {} setpoint retries)", e, max_retries),
                    )),
                }
            }
        }
    }
}

/// Interrupts pass through; everything else ends the run.
fn stability_failure(index: usize, e: StabilityError) -> StepFailure {
    match e {
        StabilityError::Interrupted(interrupt) => StepFailure::Interrupted(interrupt),
        e => StepFailure::Fatal(fatal_stability(index, e)),
    }
}

fn fatal_stability(index: usize, source: StabilityError) -> RunFailure {
    let error = RunError::Stability {
        setpoint_index: index,
        source,
    };
    RunFailure::fault(error.kind(), Some(index), &error)
}

fn fatal_acquisition(index: usize, source: AcquisitionError) -> RunFailure {
    let error = RunError::Acquisition {
        setpoint_index: index,
        source,
    };
    RunFailure::fault(error.kind(), Some(index), &error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::{shared, MemorySink};
    use crate::hardware::mock::{ScriptedCryostat, ScriptedSourceMeter, SourceMeterRemote};
    use tracing_test::traced_test;

    fn engine(source: ScriptedSourceMeter) -> (RunEngine, SourceMeterRemote) {
        let remote = source.remote();
        let hardware = HardwareSet::new(source, ScriptedCryostat::tracking());
        let engine = RunEngine::new(
            hardware,
            shared(MemorySink::new()),
            Arc::new(EngineConfig::default()),
        );
        (engine, remote)
    }

    fn recipe() -> RunRecipe {
        RunRecipe::new("unit").with_setpoint(
            SetpointSpec::new(10.0, Duration::from_secs(3), Duration::from_secs(30))
                .with_source_values(&[1e-4]),
        )
    }

    #[tokio::test]
    async fn test_control_requires_active_run() {
        let (engine, _) = engine(ScriptedSourceMeter::new(100.0));

        assert!(matches!(engine.pause(), Err(RunError::InvalidState(s)) if s == "idle"));
        assert!(matches!(engine.resume(), Err(RunError::InvalidState(_))));
        engine.abort("nothing to abort");
        assert_eq!(engine.state(), RunState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_without_pause_is_rejected() {
        let (engine, _) = engine(ScriptedSourceMeter::new(100.0));
        engine.start(&recipe()).unwrap();

        assert!(matches!(engine.resume(), Err(RunError::InvalidState(s)) if s == "running"));
        assert_eq!(engine.wait().await.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_runs_again_after_completion() {
        let (engine, remote) = engine(ScriptedSourceMeter::new(100.0));

        let first = engine.start(&recipe()).unwrap();
        engine.wait().await;
        let second = engine.start(&recipe()).unwrap();
        let state = engine.wait().await;

        assert_ne!(first, second);
        assert_eq!(state.run_uid, Some(second));
        assert_eq!(state.samples_emitted, 1);
        assert_eq!(remote.zero_and_disable_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_run_logs_lifecycle() {
        let (engine, _) = engine(ScriptedSourceMeter::new(100.0));
        engine.start(&recipe()).unwrap();
        engine.wait().await;

        assert!(logs_contain("Starting run"));
        assert!(logs_contain("Source zeroed and disabled"));
        assert!(logs_contain("Run completed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibrate_restores_safe_state() {
        let (engine, remote) = engine(ScriptedSourceMeter::new(100.0).with_noise_floor(1e-6));

        let result = engine
            .calibrate(CalibrationParams::default(), SafetyLimits::default())
            .await
            .unwrap();

        assert!(result.spread < 0.05);
        assert_eq!(remote.zero_and_disable_calls(), 1);
        assert!(!remote.output_enabled());
        assert!(!engine.hardware.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibrate_while_running_is_busy() {
        let (engine, _) = engine(ScriptedSourceMeter::new(100.0));
        engine.start(&recipe()).unwrap();

        let err = engine
            .calibrate(CalibrationParams::default(), SafetyLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::HardwareBusy));
        engine.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_iv_curve_restores_safe_state() {
        let (engine, remote) = engine(ScriptedSourceMeter::new(100.0));
        let params = IvCurveParams {
            min_excitation: 1e-6,
            max_excitation: 1e-5,
            readings_per_polarity: 2,
            ..IvCurveParams::default()
        };

        let points = engine.iv_curve(params, SafetyLimits::default()).await.unwrap();

        assert_eq!(points.len(), 2 * 2 * 2);
        assert_eq!(remote.zero_and_disable_calls(), 1);
        assert!(!remote.output_enabled());
        assert!(!engine.hardware.is_busy());
    }
}
