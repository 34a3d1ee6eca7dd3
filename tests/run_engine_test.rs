//! End-to-end runs against scripted hardware.
//!
//! All tests run on paused tokio time, so settle windows of tens of seconds
//! complete instantly and elapsed times are exact.

use parking_lot::Mutex;
use resistance_daq::config::EngineConfig;
use resistance_daq::data::storage::{shared, DataSink, MemorySink};
use resistance_daq::error::{AdapterError, ErrorKind, RunError};
use resistance_daq::experiment::{
    AbortReason, AcquisitionErrorPolicy, QualityFlag, ReductionMethod, RunEngine, RunEvent,
    RunPolicy, RunRecipe, RunStatus, Sample, SetpointSpec, TimeoutPolicy,
};
use resistance_daq::hardware::mock::{
    CryostatRemote, ScriptedCryostat, ScriptedSourceMeter, SourceMeterRemote,
};
use resistance_daq::hardware::HardwareSet;
use std::sync::Arc;
use std::time::Duration;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

/// Settles within 5 s of polling, gives up after a minute.
fn setpoint(target: f64, values: &[f64]) -> SetpointSpec {
    SetpointSpec::new(target, secs(5), secs(60)).with_source_values(values)
}

struct Rig {
    engine: RunEngine,
    sink: Arc<Mutex<MemorySink>>,
    source: SourceMeterRemote,
    cryostat: CryostatRemote,
    hardware: HardwareSet,
}

fn rig(source: ScriptedSourceMeter, cryostat: ScriptedCryostat) -> Rig {
    let source_remote = source.remote();
    let cryostat_remote = cryostat.remote();
    let hardware = HardwareSet::new(source, cryostat);
    let sink = shared(MemorySink::new());
    let engine = RunEngine::new(
        hardware.clone(),
        sink.clone(),
        Arc::new(EngineConfig::default()),
    );
    Rig {
        engine,
        sink,
        source: source_remote,
        cryostat: cryostat_remote,
        hardware,
    }
}

fn tracking_rig() -> Rig {
    rig(ScriptedSourceMeter::new(100.0), ScriptedCryostat::tracking())
}

#[tokio::test(start_paused = true)]
async fn test_samples_arrive_in_setpoint_and_excitation_order() {
    let rig = tracking_rig();
    // Targets are deliberately not monotonic
    let recipe = RunRecipe::new("order")
        .with_setpoint(setpoint(10.0, &[1e-4, 1e-3]))
        .with_setpoint(setpoint(20.0, &[1e-4, 1e-3]))
        .with_setpoint(setpoint(15.0, &[1e-4, 1e-3]));

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.samples_emitted, 6);
    assert!(state.last_error.is_none());

    let sink = rig.sink.lock();
    let order: Vec<(usize, usize)> = sink
        .samples()
        .iter()
        .map(|s| (s.setpoint_index, s.excitation_index))
        .collect();
    assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);
    assert!(sink
        .samples()
        .iter()
        .all(|s| s.quality_flag == QualityFlag::Normal));
    assert!((sink.samples()[1].derived_resistance - 100.0).abs() < 1e-9);
    assert_eq!(sink.samples()[4].measured_temperature, 15.0);

    let names = sink.event_names();
    assert_eq!(names.first(), Some(&"run_started"));
    assert_eq!(names.last(), Some(&"run_completed"));
    assert_eq!(sink.count("setpoint_completed"), 3);
    assert_eq!(sink.count("sample_acquired"), 6);
    assert_eq!(sink.flushes(), 1);

    assert_eq!(rig.cryostat.targets(), vec![10.0, 20.0, 15.0]);
    assert_eq!(rig.source.zero_and_disable_calls(), 1);
    assert!(!rig.source.output_enabled());
    assert!(!rig.hardware.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_setpoint_completed_reports_eta() {
    let rig = tracking_rig();
    let recipe = RunRecipe::new("eta")
        .with_setpoint(setpoint(10.0, &[1e-4]))
        .with_setpoint(setpoint(11.0, &[1e-4]))
        .with_setpoint(setpoint(12.0, &[1e-4]));

    rig.engine.start(&recipe).unwrap();
    rig.engine.wait().await;

    let sink = rig.sink.lock();
    let etas: Vec<Duration> = sink
        .events()
        .iter()
        .filter_map(|e| match &e.event {
            RunEvent::SetpointCompleted {
                estimated_remaining,
                ..
            } => Some(*estimated_remaining),
            _ => None,
        })
        .collect();
    assert_eq!(etas.len(), 3);
    assert!(etas[0] > etas[1]);
    assert_eq!(etas[2], Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_abort_twice_emits_one_run_aborted() {
    let rig = rig(
        ScriptedSourceMeter::new(100.0),
        ScriptedCryostat::never_settles(1.0),
    );
    let recipe = RunRecipe::new("abort")
        .with_setpoint(SetpointSpec::new(10.0, secs(5), secs(600)).with_source_values(&[1e-4]));

    rig.engine.start(&recipe).unwrap();
    tokio::time::sleep(secs(5)).await;
    rig.engine.abort("operator stop");
    rig.engine.abort("second request");
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.last_error.unwrap();
    assert_eq!(failure.reason, AbortReason::Operator);
    assert_eq!(failure.kind, ErrorKind::OperatorAbort);
    assert!(failure.message.contains("operator stop"));

    // abort after the run ended is a no-op
    rig.engine.abort("late");

    let sink = rig.sink.lock();
    assert_eq!(sink.count("run_aborted"), 1);
    assert_eq!(sink.count("run_completed"), 0);
    assert_eq!(rig.source.zero_and_disable_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_is_observed_within_one_poll_interval() {
    let rig = rig(
        ScriptedSourceMeter::new(100.0),
        ScriptedCryostat::never_settles(1.0),
    );
    let recipe = RunRecipe::new("abort")
        .with_setpoint(SetpointSpec::new(10.0, secs(5), secs(600)).with_source_values(&[1e-4]));

    rig.engine.start(&recipe).unwrap();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let polls_before = rig.cryostat.reads();
    rig.engine.abort("now");
    rig.engine.wait().await;

    assert!(rig.cryostat.reads() <= polls_before + 1);
}

#[tokio::test(start_paused = true)]
async fn test_stability_timeout_aborts_by_default() {
    let rig = rig(
        ScriptedSourceMeter::new(100.0),
        ScriptedCryostat::never_settles(1.0),
    );
    let recipe = RunRecipe::new("timeout").with_setpoint(setpoint(10.0, &[1e-4]));

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.last_error.unwrap();
    assert_eq!(failure.kind, ErrorKind::StabilityTimeout);
    assert_eq!(failure.reason, AbortReason::Fault);
    assert_eq!(failure.setpoint_index, Some(0));

    let sink = rig.sink.lock();
    assert!(sink.samples().is_empty());
    assert_eq!(sink.count("stability_timeout"), 1);
    let timeout = sink
        .events()
        .iter()
        .find_map(|e| match &e.event {
            RunEvent::StabilityTimeout { last_reading, .. } => Some(*last_reading),
            _ => None,
        })
        .unwrap();
    assert_eq!(timeout, Some(11.0));
    assert_eq!(rig.source.zero_and_disable_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_proceed_anyway_marks_samples_degraded() {
    let rig = rig(
        ScriptedSourceMeter::new(100.0),
        ScriptedCryostat::never_settles(1.0),
    );
    let recipe = RunRecipe::new("proceed")
        .with_policy(RunPolicy {
            on_timeout: TimeoutPolicy::ProceedAnyway,
            ..RunPolicy::default()
        })
        .with_setpoint(setpoint(10.0, &[1e-4, 1e-3]));

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    let sink = rig.sink.lock();
    assert_eq!(sink.samples().len(), 2);
    assert!(sink
        .samples()
        .iter()
        .all(|s| s.quality_flag == QualityFlag::Degraded));
}

#[tokio::test(start_paused = true)]
async fn test_skip_policy_moves_to_next_setpoint() {
    // Anything above 100 K never reaches its target
    let cryostat = ScriptedCryostat::new(
        0.0,
        Box::new(|_: Duration, target: f64| if target > 100.0 { target + 5.0 } else { target }),
    );
    let rig = rig(ScriptedSourceMeter::new(100.0), cryostat);
    let recipe = RunRecipe::new("skip")
        .with_policy(RunPolicy {
            on_timeout: TimeoutPolicy::Skip,
            ..RunPolicy::default()
        })
        .with_setpoint(setpoint(300.0, &[1e-4]))
        .with_setpoint(setpoint(10.0, &[1e-4]));

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    let sink = rig.sink.lock();
    assert_eq!(sink.count("setpoint_skipped"), 1);
    assert_eq!(sink.samples().len(), 1);
    assert_eq!(sink.samples()[0].setpoint_index, 1);
    match &sink.events().last().unwrap().event {
        RunEvent::RunCompleted {
            samples, skipped, ..
        } => {
            assert_eq!(*samples, 1);
            assert_eq!(*skipped, 1);
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_read_failures_degrade_sample() {
    let rig = tracking_rig();
    rig.source
        .fail_next_reads(2, AdapterError::Timeout(Duration::from_millis(500)));
    let recipe = RunRecipe::new("retry").with_setpoint(setpoint(10.0, &[1e-4]));

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    let sink = rig.sink.lock();
    assert_eq!(sink.samples().len(), 1);
    assert_eq!(sink.samples()[0].quality_flag, QualityFlag::Degraded);
    assert_eq!(sink.count("instrument_error"), 0);
    assert_eq!(rig.source.reads(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_instrument_fault_retries_setpoint_then_skips() {
    let rig = tracking_rig();
    rig.source.fail_all_reads(Some(AdapterError::Disconnected));
    let recipe = RunRecipe::new("fault").with_setpoint(setpoint(10.0, &[1e-4]));

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    let sink = rig.sink.lock();
    let attempts: Vec<u32> = sink
        .events()
        .iter()
        .filter_map(|e| match &e.event {
            RunEvent::StartedStep { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![0, 1]);
    assert_eq!(sink.count("instrument_error"), 2);
    assert_eq!(sink.count("setpoint_skipped"), 1);
    assert!(sink.samples().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_abort_run_policy_fails_on_instrument_fault() {
    let rig = tracking_rig();
    rig.source.fail_all_reads(Some(AdapterError::Nack("E-113".into())));
    let recipe = RunRecipe::new("fault")
        .with_policy(RunPolicy {
            on_acquisition_error: AcquisitionErrorPolicy::AbortRun,
            ..RunPolicy::default()
        })
        .with_setpoint(setpoint(10.0, &[1e-4]))
        .with_setpoint(setpoint(20.0, &[1e-4]));

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Failed);
    let failure = state.last_error.unwrap();
    assert_eq!(failure.kind, ErrorKind::InstrumentFault);
    assert_eq!(failure.reason, AbortReason::Fault);
    assert!(failure.message.contains("E-113"));
    assert_eq!(rig.cryostat.targets(), vec![10.0]);
}

#[tokio::test(start_paused = true)]
async fn test_stable_after_twelve_seconds_yields_one_normal_sample() {
    let rig = rig(
        ScriptedSourceMeter::new(100.0),
        ScriptedCryostat::settles_after(secs(12), 1.0),
    );
    let recipe = RunRecipe::new("settle")
        .with_setpoint(SetpointSpec::new(10.0, secs(30), secs(120)).with_source_values(&[1e-4]));

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    let sink = rig.sink.lock();
    assert_eq!(sink.samples().len(), 1);
    assert_eq!(sink.samples()[0].quality_flag, QualityFlag::Normal);

    let elapsed = sink
        .events()
        .iter()
        .find_map(|e| match &e.event {
            RunEvent::StabilityReached { elapsed, .. } => Some(*elapsed),
            _ => None,
        })
        .unwrap();
    // in band from 12 s, window of 30 s
    assert!(elapsed >= secs(42) && elapsed < secs(45), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_pause_restarts_stability_wait() {
    let rig = tracking_rig();
    let recipe = RunRecipe::new("pause")
        .with_setpoint(SetpointSpec::new(10.0, secs(30), secs(120)).with_source_values(&[1e-4]));

    rig.engine.start(&recipe).unwrap();
    tokio::time::sleep(secs(20)).await;
    rig.engine.pause().unwrap();
    let paused = rig.engine.wait_for_status(RunStatus::Paused).await;
    assert_eq!(paused.current_setpoint_index, Some(0));

    // a second pause is rejected while paused
    assert!(matches!(rig.engine.pause(), Err(RunError::InvalidState(_))));

    tokio::time::sleep(secs(100)).await;
    rig.engine.resume().unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    let sink = rig.sink.lock();
    assert_eq!(sink.count("paused"), 1);
    assert_eq!(sink.count("resumed"), 1);
    assert_eq!(sink.count("started_step"), 2);
    assert_eq!(sink.count("stability_reached"), 1);
    assert_eq!(sink.samples().len(), 1);

    let elapsed = sink
        .events()
        .iter()
        .find_map(|e| match &e.event {
            RunEvent::StabilityReached { elapsed, .. } => Some(*elapsed),
            _ => None,
        })
        .unwrap();
    // measured from the restart, not from the first attempt
    assert!(elapsed >= secs(30) && elapsed < secs(35), "{elapsed:?}");
    assert_eq!(rig.cryostat.targets(), vec![10.0, 10.0]);
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_paused_fails_run() {
    let rig = tracking_rig();
    let recipe = RunRecipe::new("pause")
        .with_setpoint(SetpointSpec::new(10.0, secs(30), secs(120)).with_source_values(&[1e-4]));

    rig.engine.start(&recipe).unwrap();
    rig.engine.pause().unwrap();
    rig.engine.wait_for_status(RunStatus::Paused).await;
    rig.engine.abort("done for today");
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.last_error.unwrap().reason, AbortReason::Operator);
    assert_eq!(rig.source.zero_and_disable_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_run_on_same_hardware_is_busy() {
    let rig = rig(
        ScriptedSourceMeter::new(100.0),
        ScriptedCryostat::never_settles(1.0),
    );
    let other = RunEngine::new(
        rig.hardware.clone(),
        shared(MemorySink::new()),
        Arc::new(EngineConfig::default()),
    );
    let long = RunRecipe::new("long")
        .with_setpoint(SetpointSpec::new(10.0, secs(5), secs(600)).with_source_values(&[1e-4]));

    rig.engine.start(&long).unwrap();
    let err = other.start(&long).unwrap_err();
    assert!(matches!(err, RunError::HardwareBusy));
    assert_eq!(err.kind(), ErrorKind::HardwareBusy);
    // the first run is unaffected
    assert_eq!(rig.engine.state().status, RunStatus::Running);

    rig.engine.abort("make room");
    rig.engine.wait().await;
    assert!(!rig.hardware.is_busy());

    other.start(&long).unwrap();
    other.abort("done");
    assert_eq!(other.wait().await.status, RunStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_delta_mode_cancels_thermal_offset() {
    let recipe = |reduction| {
        RunRecipe::new("delta")
            .with_reduction(reduction)
            .with_setpoint(setpoint(10.0, &[1e-4]))
    };

    let delta = rig(
        ScriptedSourceMeter::new(100.0).with_thermal_offset(1e-3),
        ScriptedCryostat::tracking(),
    );
    delta.engine.start(&recipe(ReductionMethod::Delta)).unwrap();
    delta.engine.wait().await;

    let plain = rig(
        ScriptedSourceMeter::new(100.0).with_thermal_offset(1e-3),
        ScriptedCryostat::tracking(),
    );
    plain.engine.start(&recipe(ReductionMethod::FourPoint)).unwrap();
    plain.engine.wait().await;

    let delta_r = delta.sink.lock().samples()[0].derived_resistance;
    let plain_r = plain.sink.lock().samples()[0].derived_resistance;
    assert!((delta_r - 100.0).abs() < 1e-9, "{delta_r}");
    // 1 mV over 100 µA
    assert!((plain_r - 110.0).abs() < 1e-9, "{plain_r}");
    assert_eq!(delta.source.set_source_calls(), vec![1e-4, -1e-4]);
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_see_the_sink_event_order() {
    let rig = tracking_rig();
    let mut events = rig.engine.subscribe();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let listener = {
        let seen = seen.clone();
        rig.engine.add_listener(move |event| seen.lock().push(event.name()))
    };
    let recipe = RunRecipe::new("subscribe")
        .with_setpoint(setpoint(10.0, &[1e-4]))
        .with_setpoint(setpoint(20.0, &[1e-4]));

    rig.engine.start(&recipe).unwrap();
    let mut received = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        let terminal = event.is_terminal();
        received.push(event.name());
        if terminal {
            break;
        }
    }
    rig.engine.wait().await;
    // let the listener drain
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    listener.abort();

    assert_eq!(received, rig.sink.lock().event_names());
    assert_eq!(*seen.lock(), received);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_recipe_is_rejected_before_taking_hardware() {
    let rig = tracking_rig();
    let recipe = RunRecipe::new("bad").with_setpoint(setpoint(10.0, &[5e-3]));

    let err = rig.engine.start(&recipe).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRecipe);
    assert!(!rig.hardware.is_busy());
    assert_eq!(rig.engine.state().status, RunStatus::Idle);
}

/// Starts the queued run from inside the callback that reports `RunCompleted`.
struct RestartOnCompletion {
    log: MemorySink,
    next: Arc<Mutex<Option<(Arc<RunEngine>, RunRecipe)>>>,
    restarted: Arc<Mutex<Option<String>>>,
}

impl DataSink for RestartOnCompletion {
    fn on_sample(&mut self, sample: Sample) {
        self.log.on_sample(sample);
    }

    fn on_event(&mut self, event: RunEvent) {
        let completed = matches!(event, RunEvent::RunCompleted { .. });
        self.log.on_event(event);
        if completed {
            if let Some((engine, recipe)) = self.next.lock().take() {
                *self.restarted.lock() = Some(engine.start(&recipe).unwrap());
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_run_started_on_terminal_event_keeps_its_state() {
    let next = Arc::new(Mutex::new(None));
    let restarted = Arc::new(Mutex::new(None));
    let sink = shared(RestartOnCompletion {
        log: MemorySink::new(),
        next: next.clone(),
        restarted: restarted.clone(),
    });
    let engine = Arc::new(RunEngine::new(
        HardwareSet::new(ScriptedSourceMeter::new(100.0), ScriptedCryostat::tracking()),
        sink.clone(),
        Arc::new(EngineConfig::default()),
    ));

    let short = RunRecipe::new("short").with_setpoint(setpoint(10.0, &[1e-4]));
    // ten minutes of readings once settled
    let long = RunRecipe::new("long").with_setpoint(
        setpoint(20.0, &[1e-4]).with_samples(10, secs(60)),
    );
    *next.lock() = Some((engine.clone(), long));

    engine.start(&short).unwrap();
    let after_first = engine.wait().await;

    let second = restarted.lock().clone().expect("follow-up run started");
    assert_eq!(after_first.run_uid.as_deref(), Some(second.as_str()));
    assert_eq!(after_first.status, RunStatus::Running);

    engine.pause().unwrap();
    let paused = engine.wait_for_status(RunStatus::Paused).await;
    assert_eq!(paused.run_uid.as_deref(), Some(second.as_str()));

    engine.abort("end of test");
    let last = engine.wait().await;
    assert_eq!(last.status, RunStatus::Failed);
    assert_eq!(last.run_uid, Some(second));

    let sink = sink.lock();
    assert_eq!(sink.log.count("run_started"), 2);
    assert_eq!(sink.log.count("run_completed"), 1);
    assert_eq!(sink.log.count("run_aborted"), 1);
}

/// Starts 10 K below each target and warms at 1 K/s until it arrives.
fn ramping_cryostat() -> ScriptedCryostat {
    ScriptedCryostat::new(
        0.0,
        Box::new(|elapsed: Duration, target: f64| (target - 10.0 + elapsed.as_secs_f64()).min(target)),
    )
}

fn sweep(target: f64, values: &[f64]) -> SetpointSpec {
    setpoint(target, values)
        .with_samples(1, secs(2))
        .sweeping()
}

#[tokio::test(start_paused = true)]
async fn test_sweep_measures_until_target_is_reached() {
    let rig = rig(ScriptedSourceMeter::new(100.0), ramping_cryostat());
    let recipe = RunRecipe::new("sweep").with_setpoint(sweep(20.0, &[1e-4]));

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    let sink = rig.sink.lock();
    // passes start every 2.1 s; the poll at 10.5 s is the first in band
    assert_eq!(sink.samples().len(), 6);
    assert_eq!(state.samples_emitted, 6);
    let temperatures: Vec<f64> = sink.samples().iter().map(|s| s.measured_temperature).collect();
    assert!(temperatures[0] < 11.0, "{temperatures:?}");
    assert!(temperatures.windows(2).all(|w| w[0] <= w[1]), "{temperatures:?}");
    assert_eq!(temperatures[5], 20.0);
    assert!(sink
        .samples()
        .iter()
        .all(|s| s.quality_flag == QualityFlag::Normal));

    assert_eq!(sink.count("stability_reached"), 0);
    let completed = sink
        .events()
        .iter()
        .find_map(|e| match &e.event {
            RunEvent::SetpointCompleted { samples, .. } => Some(*samples),
            _ => None,
        })
        .unwrap();
    assert_eq!(completed, 6);
    match &sink.events().last().unwrap().event {
        RunEvent::RunCompleted { samples, .. } => assert_eq!(*samples, 6),
        other => panic!("unexpected terminal event {other:?}"),
    }
    assert_eq!(rig.cryostat.targets(), vec![20.0]);
    assert_eq!(rig.source.zero_and_disable_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_samples_are_published_before_arrival() {
    let rig = rig(ScriptedSourceMeter::new(100.0), ramping_cryostat());
    let recipe = RunRecipe::new("live").with_setpoint(sweep(20.0, &[1e-4, 1e-3]));

    rig.engine.start(&recipe).unwrap();
    tokio::time::sleep(secs(5)).await;
    let state = rig.engine.state();
    assert_eq!(state.status, RunStatus::Running);
    assert!(state.samples_emitted >= 4, "{state:?}");
    assert_eq!(rig.sink.lock().count("setpoint_completed"), 0);

    assert_eq!(rig.engine.wait().await.status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_timeout_skip_keeps_published_samples() {
    let rig = rig(
        ScriptedSourceMeter::new(100.0),
        ScriptedCryostat::never_settles(1.0),
    );
    let mut slow = sweep(10.0, &[1e-4]);
    slow.max_settle_wait = secs(10);
    let recipe = RunRecipe::new("sweep skip")
        .with_policy(RunPolicy {
            on_timeout: TimeoutPolicy::Skip,
            ..RunPolicy::default()
        })
        .with_setpoint(slow);

    rig.engine.start(&recipe).unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    let sink = rig.sink.lock();
    assert_eq!(sink.count("stability_timeout"), 1);
    assert_eq!(sink.count("setpoint_skipped"), 1);
    assert_eq!(sink.count("setpoint_completed"), 0);
    // passes at 0, 2.1, .. 10.5 s; the sixth one runs past the 10 s limit
    assert_eq!(sink.samples().len(), 6);
    assert!(sink.samples().iter().all(|s| s.measured_temperature == 11.0));
    match &sink.events().last().unwrap().event {
        RunEvent::RunCompleted {
            samples, skipped, ..
        } => {
            assert_eq!(*samples, 6);
            assert_eq!(*skipped, 1);
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_pause_during_sweep_keeps_samples_and_recommands_target() {
    let rig = rig(ScriptedSourceMeter::new(100.0), ramping_cryostat());
    let recipe = RunRecipe::new("sweep pause").with_setpoint(sweep(20.0, &[1e-4]));

    rig.engine.start(&recipe).unwrap();
    tokio::time::sleep(secs(5)).await;
    rig.engine.pause().unwrap();
    rig.engine.wait_for_status(RunStatus::Paused).await;
    let before = rig.sink.lock().samples().len();
    assert!(before >= 2, "{before}");

    tokio::time::sleep(secs(60)).await;
    assert_eq!(rig.sink.lock().samples().len(), before);
    rig.engine.resume().unwrap();
    let state = rig.engine.wait().await;

    assert_eq!(state.status, RunStatus::Completed);
    let sink = rig.sink.lock();
    let total = sink.samples().len();
    assert!(total > before);
    assert_eq!(state.samples_emitted, total);
    assert_eq!(sink.count("started_step"), 2);
    let completed = sink
        .events()
        .iter()
        .find_map(|e| match &e.event {
            RunEvent::SetpointCompleted { samples, .. } => Some(*samples),
            _ => None,
        })
        .unwrap();
    assert_eq!(completed, total);
    assert_eq!(rig.cryostat.targets(), vec![20.0, 20.0]);
}
