//! Mock Hardware Implementations
//!
//! Provides scripted and simulated instruments for running without physical
//! hardware. All mock devices use async-safe operations (tokio::time, not
//! std::thread::sleep), so tests can run on paused virtual time.
//!
//! # Available Mocks
//!
//! - `ScriptedSourceMeter` - Ohmic sample with injectable read failures and
//!   responses. A cloned `SourceMeterRemote` observes and steers it after it
//!   has been moved into a `HardwareSet`.
//! - `ScriptedCryostat` - Temperature follows a closure of (time since the
//!   last `set_target`, target). Steered through a `CryostatRemote`.
//! - `SimulatedCryostat` / `SimulatedSourceMeter` - First-order thermal model
//!   with ramp limiting and noise, sharing one thermal state. Used by the CLI.

use crate::config::SimulationConfig;
use crate::error::AdapterError;
use crate::hardware::{
    HardwareSet, InstrumentReading, InstrumentStatus, SourceMeter, TemperatureController,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

// =============================================================================
// ScriptedSourceMeter - Ohmic sample with fault injection
// =============================================================================

#[derive(Debug)]
struct SourceState {
    resistance: f64,
    thermal_offset: f64,
    noise_floor: f64,
    report_sensed: bool,
    source: f64,
    enabled: bool,
    set_source_calls: Vec<f64>,
    reads: u32,
    zero_and_disable_calls: u32,
    pending_read_failures: VecDeque<AdapterError>,
    persistent_read_failure: Option<AdapterError>,
    response_override: Option<f64>,
    zero_failure: Option<AdapterError>,
}

/// Shared view of a [`ScriptedSourceMeter`].
#[derive(Debug, Clone)]
pub struct SourceMeterRemote {
    state: Arc<Mutex<SourceState>>,
}

impl SourceMeterRemote {
    /// Makes the next `count` reads fail with `error`.
    pub fn fail_next_reads(&self, count: usize, error: AdapterError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.pending_read_failures.push_back(error.clone());
        }
    }

    /// Makes every read fail until cleared with `None`.
    pub fn fail_all_reads(&self, error: Option<AdapterError>) {
        self.state.lock().persistent_read_failure = error;
    }

    /// Replaces the ohmic response with a fixed value.
    pub fn set_response_override(&self, response: Option<f64>) {
        self.state.lock().response_override = response;
    }

    pub fn fail_zero_and_disable(&self, error: Option<AdapterError>) {
        self.state.lock().zero_failure = error;
    }

    pub fn set_source_calls(&self) -> Vec<f64> {
        self.state.lock().set_source_calls.clone()
    }

    pub fn reads(&self) -> u32 {
        self.state.lock().reads
    }

    pub fn zero_and_disable_calls(&self) -> u32 {
        self.state.lock().zero_and_disable_calls
    }

    pub fn output_enabled(&self) -> bool {
        self.state.lock().enabled
    }
}

/// Source meter measuring a fixed resistor.
///
/// The response is `I·R + thermal_offset`, so four-point readings carry the
/// offset and delta-mode readings cancel it.
///
/// # Example
///
/// ```rust,ignore
/// let meter = ScriptedSourceMeter::new(100.0);
/// let remote = meter.remote();
/// remote.fail_next_reads(2, AdapterError::Timeout(Duration::from_secs(1)));
/// ```
pub struct ScriptedSourceMeter {
    id: String,
    settling_delay: Duration,
    state: Arc<Mutex<SourceState>>,
}

impl ScriptedSourceMeter {
    pub fn new(resistance: f64) -> Self {
        Self {
            id: "scripted_source".to_string(),
            settling_delay: Duration::from_millis(100),
            state: Arc::new(Mutex::new(SourceState {
                resistance,
                thermal_offset: 0.0,
                noise_floor: 0.0,
                report_sensed: false,
                source: 0.0,
                enabled: false,
                set_source_calls: Vec::new(),
                reads: 0,
                zero_and_disable_calls: 0,
                pending_read_failures: VecDeque::new(),
                persistent_read_failure: None,
                response_override: None,
                zero_failure: None,
            })),
        }
    }

    pub fn with_thermal_offset(self, offset: f64) -> Self {
        self.state.lock().thermal_offset = offset;
        self
    }

    /// Adds `+noise`/`-noise` volts to alternate reads.
    pub fn with_noise_floor(self, noise: f64) -> Self {
        self.state.lock().noise_floor = noise;
        self
    }

    /// Report the sourced value alongside every reading.
    pub fn with_sensed_excitation(self) -> Self {
        self.state.lock().report_sensed = true;
        self
    }

    pub fn with_settling_delay(mut self, delay: Duration) -> Self {
        self.settling_delay = delay;
        self
    }

    pub fn remote(&self) -> SourceMeterRemote {
        SourceMeterRemote {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl SourceMeter for ScriptedSourceMeter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_source(&mut self, value: f64) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        state.source = value;
        state.enabled = true;
        state.set_source_calls.push(value);
        Ok(())
    }

    async fn read_measurement(&mut self) -> Result<InstrumentReading, AdapterError> {
        let mut state = self.state.lock();
        state.reads += 1;
        if let Some(err) = state.pending_read_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.persistent_read_failure {
            return Err(err.clone());
        }
        let noise = if state.reads % 2 == 1 {
            state.noise_floor
        } else {
            -state.noise_floor
        };
        let response = state
            .response_override
            .unwrap_or(state.source * state.resistance + state.thermal_offset + noise);
        Ok(InstrumentReading {
            response,
            sensed_excitation: state.report_sensed.then_some(state.source),
        })
    }

    async fn zero_and_disable(&mut self) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        state.zero_and_disable_calls += 1;
        if let Some(err) = &state.zero_failure {
            return Err(err.clone());
        }
        state.source = 0.0;
        state.enabled = false;
        Ok(())
    }

    async fn get_status(&self) -> Result<InstrumentStatus, AdapterError> {
        let state = self.state.lock();
        if state.persistent_read_failure.is_some() {
            Ok(InstrumentStatus::Fault)
        } else {
            Ok(InstrumentStatus::Ready)
        }
    }

    fn settling_delay(&self) -> Duration {
        self.settling_delay
    }
}

// =============================================================================
// ScriptedCryostat - Temperature profile driven by a closure
// =============================================================================

/// Temperature as a function of (time since last `set_target`, target).
pub type TemperatureProfile = Box<dyn Fn(Duration, f64) -> f64 + Send + Sync>;

#[derive(Debug, Default)]
struct CryostatState {
    targets: Vec<f64>,
    ramp_rates: Vec<f64>,
    reads: u32,
    alarm_level: u8,
    pending_read_failures: VecDeque<AdapterError>,
    persistent_read_failure: Option<AdapterError>,
    pending_target_failures: VecDeque<AdapterError>,
    temperature_override: Option<f64>,
    controller_stable: Option<bool>,
}

/// Shared view of a [`ScriptedCryostat`].
#[derive(Debug, Clone)]
pub struct CryostatRemote {
    state: Arc<Mutex<CryostatState>>,
}

impl CryostatRemote {
    pub fn fail_next_reads(&self, count: usize, error: AdapterError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.pending_read_failures.push_back(error.clone());
        }
    }

    pub fn fail_all_reads(&self, error: Option<AdapterError>) {
        self.state.lock().persistent_read_failure = error;
    }

    pub fn fail_next_set_target(&self, count: usize, error: AdapterError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.pending_target_failures.push_back(error.clone());
        }
    }

    /// Forces every reading to `temperature` regardless of the profile.
    pub fn set_temperature_override(&self, temperature: Option<f64>) {
        self.state.lock().temperature_override = temperature;
    }

    pub fn set_alarm_level(&self, level: u8) {
        self.state.lock().alarm_level = level;
    }

    /// Sets the controller's own stability verdict.
    pub fn set_controller_stable(&self, stable: Option<bool>) {
        self.state.lock().controller_stable = stable;
    }

    pub fn targets(&self) -> Vec<f64> {
        self.state.lock().targets.clone()
    }

    pub fn ramp_rates(&self) -> Vec<f64> {
        self.state.lock().ramp_rates.clone()
    }

    pub fn reads(&self) -> u32 {
        self.state.lock().reads
    }
}

/// Cryostat whose readings follow a scripted profile.
///
/// # Example
///
/// ```rust,ignore
/// // In band 12 s after every set_target, 1 K high before that.
/// let cryostat = ScriptedCryostat::settles_after(Duration::from_secs(12), 1.0);
/// ```
pub struct ScriptedCryostat {
    id: String,
    profile: TemperatureProfile,
    target: f64,
    since: Instant,
    state: Arc<Mutex<CryostatState>>,
}

impl ScriptedCryostat {
    /// `initial` is the target reported before the first `set_target`.
    pub fn new(initial: f64, profile: TemperatureProfile) -> Self {
        Self {
            id: "scripted_cryostat".to_string(),
            profile,
            target: initial,
            since: Instant::now(),
            state: Arc::new(Mutex::new(CryostatState::default())),
        }
    }

    /// Always reads `temperature`.
    pub fn constant(temperature: f64) -> Self {
        Self::new(temperature, Box::new(move |_, _| temperature))
    }

    /// Reads exactly the target once `delay` has passed since `set_target`,
    /// `offset` kelvin above it before that.
    pub fn settles_after(delay: Duration, offset: f64) -> Self {
        Self::new(
            0.0,
            Box::new(move |elapsed: Duration, target: f64| {
                if elapsed >= delay {
                    target
                } else {
                    target + offset
                }
            }),
        )
    }

    /// Tracks the target instantly.
    pub fn tracking() -> Self {
        Self::new(0.0, Box::new(|_, target| target))
    }

    /// Never comes within `offset` kelvin of the target.
    pub fn never_settles(offset: f64) -> Self {
        Self::new(0.0, Box::new(move |_, target: f64| target + offset))
    }

    pub fn remote(&self) -> CryostatRemote {
        CryostatRemote {
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl TemperatureController for ScriptedCryostat {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_target(&mut self, temperature: f64) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        if let Some(err) = state.pending_target_failures.pop_front() {
            return Err(err);
        }
        state.targets.push(temperature);
        self.target = temperature;
        self.since = Instant::now();
        Ok(())
    }

    async fn read_temperature(&mut self) -> Result<f64, AdapterError> {
        let mut state = self.state.lock();
        state.reads += 1;
        if let Some(err) = state.pending_read_failures.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.persistent_read_failure {
            return Err(err.clone());
        }
        if let Some(temperature) = state.temperature_override {
            return Ok(temperature);
        }
        Ok((self.profile)(self.since.elapsed(), self.target))
    }

    async fn is_stable(&mut self) -> Result<Option<bool>, AdapterError> {
        Ok(self.state.lock().controller_stable)
    }

    async fn set_ramp_rate(&mut self, kelvin_per_minute: f64) -> Result<(), AdapterError> {
        self.state.lock().ramp_rates.push(kelvin_per_minute);
        Ok(())
    }

    async fn alarm_level(&mut self) -> Result<u8, AdapterError> {
        Ok(self.state.lock().alarm_level)
    }
}

// =============================================================================
// Simulated rig - thermal model shared by cryostat and sample
// =============================================================================

#[derive(Debug)]
struct ThermalState {
    temperature: f64,
    target: f64,
    /// K/min, `None` for an unlimited approach.
    ramp_rate: Option<f64>,
    time_constant: Duration,
    last_update: Instant,
}

impl ThermalState {
    /// Advances the model to now: exponential approach, rate-limited while
    /// ramping.
    fn advance(&mut self) -> f64 {
        let now = Instant::now();
        let dt = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;

        let tau = self.time_constant.as_secs_f64().max(1e-3);
        let mut step = (self.target - self.temperature) * (1.0 - (-dt / tau).exp());
        if let Some(rate) = self.ramp_rate {
            let max_step = rate / 60.0 * dt;
            step = step.clamp(-max_step, max_step);
        }
        self.temperature += step;
        self.temperature
    }
}

fn noise(amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        rand::thread_rng().gen_range(-amplitude..amplitude)
    } else {
        0.0
    }
}

/// Simulated cryostat with a first-order thermal response.
pub struct SimulatedCryostat {
    id: String,
    thermal: Arc<Mutex<ThermalState>>,
    noise: f64,
    read_latency: Duration,
}

#[async_trait]
impl TemperatureController for SimulatedCryostat {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_target(&mut self, temperature: f64) -> Result<(), AdapterError> {
        sleep(self.read_latency).await;
        let mut thermal = self.thermal.lock();
        thermal.advance();
        thermal.target = temperature;
        debug!(target_temperature = temperature, "Simulated cryostat: new target");
        Ok(())
    }

    async fn read_temperature(&mut self) -> Result<f64, AdapterError> {
        sleep(self.read_latency).await;
        let temperature = self.thermal.lock().advance();
        Ok(temperature + noise(self.noise))
    }

    async fn is_stable(&mut self) -> Result<Option<bool>, AdapterError> {
        let mut thermal = self.thermal.lock();
        let temperature = thermal.advance();
        // Mirrors a controller that reports "ramping" until close to target.
        Ok(Some((temperature - thermal.target).abs() < 1.0))
    }

    async fn set_ramp_rate(&mut self, kelvin_per_minute: f64) -> Result<(), AdapterError> {
        let mut thermal = self.thermal.lock();
        thermal.advance();
        thermal.ramp_rate = Some(kelvin_per_minute);
        Ok(())
    }
}

/// Simulated source meter measuring a sample with a linear R(T).
pub struct SimulatedSourceMeter {
    id: String,
    thermal: Arc<Mutex<ThermalState>>,
    config: SimulationConfig,
    source: f64,
}

impl SimulatedSourceMeter {
    fn resistance_at(&self, temperature: f64) -> f64 {
        let c = &self.config;
        c.base_resistance * (1.0 + c.temperature_coefficient * (temperature - c.reference_temperature))
    }
}

#[async_trait]
impl SourceMeter for SimulatedSourceMeter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_source(&mut self, value: f64) -> Result<(), AdapterError> {
        sleep(self.config.read_latency).await;
        self.source = value;
        Ok(())
    }

    async fn read_measurement(&mut self) -> Result<InstrumentReading, AdapterError> {
        sleep(self.config.read_latency).await;
        let temperature = self.thermal.lock().advance();
        let ideal = self.source * self.resistance_at(temperature);
        let response = ideal * (1.0 + noise(self.config.response_noise))
            + self.config.thermal_offset;
        Ok(InstrumentReading {
            response,
            sensed_excitation: Some(self.source),
        })
    }

    async fn zero_and_disable(&mut self) -> Result<(), AdapterError> {
        self.source = 0.0;
        Ok(())
    }

    fn settling_delay(&self) -> Duration {
        self.config.settling_delay
    }
}

/// Builds a simulated source meter / cryostat pair sharing one sample.
pub fn simulated_rig(config: &SimulationConfig) -> (SimulatedSourceMeter, SimulatedCryostat) {
    let thermal = Arc::new(Mutex::new(ThermalState {
        temperature: config.initial_temperature,
        target: config.initial_temperature,
        ramp_rate: None,
        time_constant: config.time_constant,
        last_update: Instant::now(),
    }));
    let source = SimulatedSourceMeter {
        id: "simulated_source".to_string(),
        thermal: thermal.clone(),
        config: config.clone(),
        source: 0.0,
    };
    let cryostat = SimulatedCryostat {
        id: "simulated_cryostat".to_string(),
        thermal,
        noise: config.temperature_noise,
        read_latency: config.read_latency,
    };
    (source, cryostat)
}

/// Convenience: the simulated rig as a [`HardwareSet`].
pub fn simulated_hardware(config: &SimulationConfig) -> HardwareSet {
    let (source, cryostat) = simulated_rig(config);
    HardwareSet::new(source, cryostat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_source_meter_is_ohmic() {
        let mut meter = ScriptedSourceMeter::new(50.0).with_thermal_offset(1e-6);
        let remote = meter.remote();

        meter.set_source(-2e-3).await.unwrap();
        let reading = meter.read_measurement().await.unwrap();
        assert!((reading.response - (-0.1 + 1e-6)).abs() < 1e-12);
        assert_eq!(reading.sensed_excitation, None);
        assert_eq!(remote.set_source_calls(), vec![-2e-3]);
        assert!(remote.output_enabled());

        meter.zero_and_disable().await.unwrap();
        assert!(!remote.output_enabled());
        assert_eq!(remote.zero_and_disable_calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_read_failures() {
        let mut meter = ScriptedSourceMeter::new(1.0);
        let remote = meter.remote();
        remote.fail_next_reads(2, AdapterError::Disconnected);

        assert!(meter.read_measurement().await.is_err());
        assert!(meter.read_measurement().await.is_err());
        assert!(meter.read_measurement().await.is_ok());
        assert_eq!(remote.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_cryostat_profile() {
        let mut cryostat = ScriptedCryostat::settles_after(Duration::from_secs(12), 1.0);
        let remote = cryostat.remote();
        cryostat.set_target(10.0).await.unwrap();

        assert_eq!(cryostat.read_temperature().await.unwrap(), 11.0);
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(cryostat.read_temperature().await.unwrap(), 10.0);
        assert_eq!(remote.targets(), vec![10.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_rig_approaches_target() {
        let config = SimulationConfig {
            temperature_noise: 0.0,
            response_noise: 0.0,
            ..SimulationConfig::default()
        };
        let (mut source, mut cryostat) = simulated_rig(&config);
        cryostat.set_target(config.initial_temperature - 10.0).await.unwrap();

        tokio::time::sleep(config.time_constant * 10).await;
        let temperature = cryostat.read_temperature().await.unwrap();
        assert!((temperature - (config.initial_temperature - 10.0)).abs() < 0.01);

        source.set_source(1e-3).await.unwrap();
        let reading = source.read_measurement().await.unwrap();
        let expected = 1e-3 * source.resistance_at(temperature) + config.thermal_offset;
        assert!((reading.response - expected).abs() < 1e-6);
    }
}
