//! Deterministic simulated belt-coupled machine.
//!
//! Each axis has two steppers whose phase mismatch (`offset`) is set at
//! construction and changed by moves of the second stepper. Enabling a main
//! stepper makes it snap onto its phase, which the accelerometer sees as a
//! decaying oscillation and the encoder as a transient displacement, both
//! proportional to the mismatch.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{SyncError, SyncResult};
use crate::extract::rotary::TICKS_PER_REVOLUTION;
use crate::host::{
    AccelChip, EncoderChip, MotionHost, Reactor, SampleSource, SensorHub, StepperInfo,
};
use crate::types::{AccelSample, PositionSample};

/// Gravity on the z channel (mm/s^2)
const GRAVITY: f64 = -9810.0;
/// Ringing frequency of the toolhead after an impact (Hz)
const RING_FREQ: f64 = 150.0;
/// Decay time constant of the ringing (s)
const RING_TAU: f64 = 0.020;
/// Decay time constant of the encoder displacement (s)
const SNAP_TAU: f64 = 0.030;
/// Impacts older than this no longer contribute (s)
const IMPACT_HORIZON: f64 = 0.3;

#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Driver microsteps of every stepper
    pub microsteps: u32,
    pub rotation_distance: f64,
    pub full_steps_per_rotation: u32,
    /// Initial phase mismatch per axis, in driver microsteps
    pub offsets: BTreeMap<String, f64>,
    pub accel_chips: Vec<String>,
    /// Accelerometer output rate (Hz)
    pub accel_rate: f64,
    /// Encoder chip name -> axis it is mounted on
    pub encoders: BTreeMap<String, String>,
    pub encoder_period: f64,
    /// Ringing amplitude per microstep of mismatch
    pub magnitude_per_mstep: f64,
    pub noise: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        let offsets = [("x".to_string(), 5.0), ("y".to_string(), -3.0)]
            .into_iter()
            .collect();
        let encoders = [
            ("encoder_x".to_string(), "x".to_string()),
            ("encoder_y".to_string(), "y".to_string()),
        ]
        .into_iter()
        .collect();
        Self {
            microsteps: 16,
            rotation_distance: 40.0,
            full_steps_per_rotation: 200,
            offsets,
            accel_chips: vec!["adxl345".to_string()],
            accel_rate: 3200.0,
            encoders,
            encoder_period: 0.0002,
            magnitude_per_mstep: 20000.0,
            noise: 40.0,
        }
    }
}

impl SimConfig {
    fn move_d(&self) -> f64 {
        self.rotation_distance / f64::from(self.full_steps_per_rotation) / f64::from(self.microsteps)
    }
}

#[derive(Clone, Copy, Debug)]
struct Impact {
    time: f64,
    /// 0 for x, 1 for y
    channel: usize,
    axis_is_x: bool,
    offset_mm: f64,
}

#[derive(Debug)]
pub struct MachineState {
    cfg: SimConfig,
    clock: f64,
    print_time: f64,
    positions: BTreeMap<String, f64>,
    enabled: BTreeMap<String, bool>,
    impacts: Vec<Impact>,
    homed: String,
    fans: BTreeMap<String, bool>,
}

/// Axis owning a stepper and whether it is the main one
fn stepper_axis(stepper: &str) -> Option<(String, bool)> {
    let rest = stepper.strip_prefix("stepper_")?;
    match rest.strip_suffix('1') {
        Some(axis) => Some((axis.to_string(), false)),
        None => Some((rest.to_string(), true)),
    }
}

fn noise(t: f64, seed: f64) -> f64 {
    (t * 7919.0 + seed).sin() * 0.6 + (t * 3571.3 + 1.3 * seed).sin() * 0.4
}

impl MachineState {
    fn new(cfg: SimConfig) -> Self {
        Self {
            cfg,
            clock: 0.0,
            print_time: 0.0,
            positions: BTreeMap::new(),
            enabled: BTreeMap::new(),
            impacts: Vec::new(),
            homed: String::new(),
            fans: BTreeMap::new(),
        }
    }

    fn position(&self, stepper: &str) -> f64 {
        self.positions.get(stepper).copied().unwrap_or(0.0)
    }

    fn offset_mm(&self, axis: &str) -> f64 {
        let initial = self.cfg.offsets.get(axis).copied().unwrap_or(0.0) * self.cfg.move_d();
        initial + self.position(&format!("stepper_{}1", axis))
            - self.position(&format!("stepper_{}", axis))
    }

    fn accel_at(&self, t: f64) -> AccelSample {
        let mut channels = [
            self.cfg.noise * noise(t, 0.0),
            self.cfg.noise * noise(t, 2.1),
            GRAVITY + self.cfg.noise * noise(t, 4.7),
        ];
        let gain = self.cfg.magnitude_per_mstep / self.cfg.move_d();
        for impact in &self.impacts {
            let dt = t - impact.time;
            if !(0.0..IMPACT_HORIZON).contains(&dt) {
                continue;
            }
            let amplitude = gain * impact.offset_mm.abs();
            channels[impact.channel] += amplitude * (-dt / RING_TAU).exp() * (2.0 * PI * RING_FREQ * dt).sin();
        }
        AccelSample::new(t, channels[0], channels[1], channels[2])
    }

    fn encoder_at(&self, t: f64, axis: &str) -> PositionSample {
        let rd = self.cfg.rotation_distance;
        let mut mm = self.position(&format!("stepper_{}", axis)) + noise(t, 0.7) * rd / TICKS_PER_REVOLUTION;
        for impact in &self.impacts {
            let dt = t - impact.time;
            if impact.axis_is_x != (axis == "x") || !(0.0..IMPACT_HORIZON).contains(&dt) {
                continue;
            }
            mm -= impact.offset_mm * (-dt / SNAP_TAU).exp();
        }
        PositionSample::new(t, mm / rd * TICKS_PER_REVOLUTION)
    }

    fn prune_impacts(&mut self) {
        let horizon = self.print_time - IMPACT_HORIZON;
        self.impacts.retain(|impact| impact.time >= horizon);
    }
}

fn lock(state: &Mutex<MachineState>) -> MutexGuard<'_, MachineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulated printer: motion host and sensor hub over one shared state
#[derive(Clone)]
pub struct SimMachine {
    state: Arc<Mutex<MachineState>>,
}

impl SimMachine {
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(MachineState::new(cfg))),
        }
    }

    /// Current phase mismatch of an axis in driver microsteps
    pub fn offset_msteps(&self, axis: &str) -> f64 {
        let state = lock(&self.state);
        state.offset_mm(axis) / state.cfg.move_d()
    }

    pub fn fan_on(&self, fan: &str) -> Option<bool> {
        lock(&self.state).fans.get(fan).copied()
    }
}

impl Reactor for SimMachine {
    fn monotonic(&self) -> f64 {
        lock(&self.state).clock
    }

    fn pause(&mut self, until: f64) {
        let mut state = lock(&self.state);
        state.clock = state.clock.max(until);
    }
}

impl MotionHost for SimMachine {
    fn dwell(&mut self, delay: f64) -> SyncResult<()> {
        lock(&self.state).print_time += delay.max(0.0);
        Ok(())
    }

    fn last_move_time(&self) -> f64 {
        lock(&self.state).print_time
    }

    fn set_stepper_enable(&mut self, stepper: &str, enable: bool, print_time: f64) -> SyncResult<()> {
        let mut state = lock(&self.state);
        let was_enabled = state.enabled.insert(stepper.to_string(), enable).unwrap_or(false);
        if let Some((axis, true)) = stepper_axis(stepper) {
            if enable && !was_enabled {
                let offset_mm = state.offset_mm(&axis);
                state.impacts.push(Impact {
                    time: print_time,
                    channel: if axis == "x" { 0 } else { 1 },
                    axis_is_x: axis == "x",
                    offset_mm,
                });
            }
        }
        Ok(())
    }

    fn manual_move(&mut self, stepper: &str, dist: f64, speed: f64, accel: f64) -> SyncResult<()> {
        if speed <= 0.0 || accel <= 0.0 {
            return Err(SyncError::Host(format!(
                "invalid move of {}: speed {} accel {}",
                stepper, speed, accel
            )));
        }
        let d = dist.abs();
        let duration = if d < speed * speed / accel {
            2.0 * (d / accel).sqrt()
        } else {
            d / speed + speed / accel
        };
        let mut state = lock(&self.state);
        *state.positions.entry(stepper.to_string()).or_insert(0.0) += dist;
        state.print_time += duration;
        Ok(())
    }

    fn wait_moves(&mut self) -> SyncResult<()> {
        let mut state = lock(&self.state);
        state.clock = state.clock.max(state.print_time);
        Ok(())
    }

    fn axis_steppers(&self, axis: &str) -> Vec<StepperInfo> {
        let microsteps = lock(&self.state).cfg.microsteps;
        vec![
            StepperInfo::new(format!("stepper_{}", axis), microsteps),
            StepperInfo::new(format!("stepper_{}1", axis), microsteps),
        ]
    }

    fn homed_axes(&self) -> String {
        lock(&self.state).homed.clone()
    }

    fn home(&mut self, axes: &[String]) -> SyncResult<()> {
        let mut state = lock(&self.state);
        for axis in axes {
            if !state.homed.contains(axis.as_str()) {
                state.homed.push_str(axis);
            }
        }
        state.print_time += 2.0;
        Ok(())
    }

    fn travel_to(&mut self, targets: &[(String, f64)], _speed: f64) -> SyncResult<()> {
        let mut state = lock(&self.state);
        state.print_time += 0.2 * targets.len() as f64;
        Ok(())
    }

    fn max_velocity(&self) -> f64 {
        300.0
    }

    fn max_accel(&self) -> f64 {
        10000.0
    }

    fn set_fan(&mut self, fan: &str, on: bool) -> SyncResult<()> {
        lock(&self.state).fans.insert(fan.to_string(), on);
        Ok(())
    }
}

impl SensorHub for SimMachine {
    fn accelerometer(&mut self, name: &str) -> SyncResult<AccelChip> {
        let state = lock(&self.state);
        if !state.cfg.accel_chips.iter().any(|chip| chip == name) {
            return Err(SyncError::Config(format!("Unknown accelerometer '{}'", name)));
        }
        let rate = state.cfg.accel_rate;
        drop(state);
        Ok(AccelChip {
            source: Box::new(SimAccelSource::new(Arc::clone(&self.state), rate)),
            data_rate: Some(rate),
        })
    }

    fn encoder(&mut self, name: &str) -> SyncResult<EncoderChip> {
        let state = lock(&self.state);
        let axis = state
            .cfg
            .encoders
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::Config(format!("Unknown encoder '{}'", name)))?;
        let period = state.cfg.encoder_period;
        drop(state);
        Ok(EncoderChip {
            source: Box::new(SimEncoderSource::new(Arc::clone(&self.state), &axis, period)),
            sample_period: period,
            bound_stepper: format!("stepper_{}", axis),
        })
    }
}

/// Sampling cursor shared by both simulated sources
struct Stream {
    state: Arc<Mutex<MachineState>>,
    period: f64,
    cursor: f64,
    active: bool,
}

impl Stream {
    fn new(state: Arc<Mutex<MachineState>>, period: f64) -> Self {
        Self {
            state,
            period,
            cursor: 0.0,
            active: false,
        }
    }

    fn restart(&mut self) {
        let mut state = lock(&self.state);
        state.prune_impacts();
        self.cursor = state.print_time;
    }

    /// Emit every sample up to the current end of the motion queue
    fn drain<S>(&mut self, out: &mut Vec<S>, sample: impl Fn(&MachineState, f64) -> S) -> usize {
        if !self.active {
            return 0;
        }
        let state = lock(&self.state);
        let mut count = 0;
        while self.cursor < state.print_time {
            out.push(sample(&state, self.cursor));
            self.cursor += self.period;
            count += 1;
        }
        count
    }
}

pub struct SimAccelSource {
    stream: Stream,
}

impl SimAccelSource {
    fn new(state: Arc<Mutex<MachineState>>, rate: f64) -> Self {
        Self {
            stream: Stream::new(state, 1.0 / rate),
        }
    }
}

impl SampleSource for SimAccelSource {
    type Sample = AccelSample;

    fn start_session(&mut self) -> SyncResult<()> {
        self.stream.active = true;
        self.stream.restart();
        Ok(())
    }

    fn finish_session(&mut self) -> SyncResult<()> {
        self.stream.active = false;
        Ok(())
    }

    fn clear(&mut self) {
        self.stream.restart();
    }

    fn drain_into(&mut self, out: &mut Vec<AccelSample>) -> usize {
        self.stream.drain(out, |state, t| state.accel_at(t))
    }
}

pub struct SimEncoderSource {
    stream: Stream,
    axis: String,
}

impl SimEncoderSource {
    fn new(state: Arc<Mutex<MachineState>>, axis: &str, period: f64) -> Self {
        Self {
            stream: Stream::new(state, period),
            axis: axis.to_string(),
        }
    }
}

impl SampleSource for SimEncoderSource {
    type Sample = PositionSample;

    fn start_session(&mut self) -> SyncResult<()> {
        self.stream.active = true;
        self.stream.restart();
        Ok(())
    }

    fn finish_session(&mut self) -> SyncResult<()> {
        self.stream.active = false;
        Ok(())
    }

    fn clear(&mut self) {
        self.stream.restart();
    }

    fn drain_into(&mut self, out: &mut Vec<PositionSample>) -> usize {
        let axis = self.axis.clone();
        self.stream.drain(out, move |state, t| state.encoder_at(t, &axis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::CalibrateOptions;
    use crate::config::SyncConfig;
    use crate::controller::{MotorsSync, RunOptions};
    use crate::testing::MemoryReporter;

    const ACCEL_COREXY: &str = r#"{
        "kinematics": "corexy",
        "defaults": { "accel_chip": "adxl345", "head_fan": "toolhead" },
        "axis": {
            "x": { "stepper": { "rotation_distance": 40, "position_max": 300 } },
            "y": { "stepper": { "rotation_distance": 40, "position_max": 300 } }
        }
    }"#;

    fn attach(config: &str, sim: &SimMachine) -> (MotorsSync<SimMachine>, MemoryReporter) {
        let plan = SyncConfig::from_json(config).unwrap().configure().unwrap();
        let reporter = MemoryReporter::default();
        let sync = MotorsSync::attach(plan, sim.clone(), Box::new(reporter.clone())).unwrap();
        (sync, reporter)
    }

    #[test]
    fn test_stepper_axis() {
        assert_eq!(stepper_axis("stepper_x"), Some(("x".to_string(), true)));
        assert_eq!(stepper_axis("stepper_y1"), Some(("y".to_string(), false)));
        assert_eq!(stepper_axis("extruder"), None);
    }

    #[test]
    fn test_second_stepper_move_changes_offset() {
        let mut sim = SimMachine::new(SimConfig::default());
        assert!((sim.offset_msteps("x") - 5.0).abs() < 1e-9);
        sim.manual_move("stepper_x1", -2.0 * 0.0125, 150.0, 5000.0).unwrap();
        assert!((sim.offset_msteps("x") - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_alternately_sync_on_accelerometer() {
        let sim = SimMachine::new(SimConfig::default());
        let (mut sync, reporter) = attach(ACCEL_COREXY, &sim);
        let report = sync.run(&RunOptions::default()).unwrap();
        assert!(!report.in_tolerance);
        assert!(sim.offset_msteps("x").abs() <= 1.0, "x {}", sim.offset_msteps("x"));
        assert!(sim.offset_msteps("y").abs() <= 1.0, "y {}", sim.offset_msteps("y"));
        assert!(reporter.contains("Motors synchronization started"));
        assert!(reporter.contains("X-Motors adjusted by"));
        // Fan restored after the run
        assert_eq!(sim.fan_on("toolhead"), Some(true));
        for axis in &report.axes {
            assert!(axis.magnitude < axis.initial_magnitude);
        }
    }

    #[test]
    fn test_synchronous_sync_on_accelerometer() {
        let sim = SimMachine::new(SimConfig::default());
        let config = ACCEL_COREXY.replace("\"kinematics\"", "\"sync_method\": \"synchronous\", \"kinematics\"");
        let (mut sync, _) = attach(&config, &sim);
        sync.run(&RunOptions::default()).unwrap();
        assert!(sim.offset_msteps("x").abs() <= 1.0);
        assert!(sim.offset_msteps("y").abs() <= 1.0);
    }

    #[test]
    fn test_sequential_sync_on_encoders() {
        let cfg = SimConfig {
            offsets: [("x".to_string(), -6.0)].into_iter().collect(),
            ..SimConfig::default()
        };
        let sim = SimMachine::new(cfg);
        let config = r#"{
            "kinematics": "cartesian",
            "axes": ["x"],
            "axis": {
                "x": {
                    "stepper": { "rotation_distance": 40, "position_max": 300 },
                    "encoder_chip": "encoder_x"
                }
            }
        }"#;
        let (mut sync, _) = attach(config, &sim);
        let report = sync.run(&RunOptions::default()).unwrap();
        assert!(sim.offset_msteps("x").abs() <= 1.0, "x {}", sim.offset_msteps("x"));
        assert_eq!(report.axes[0].dim_type, "deviation");
        // 6 msteps of 12.5 um
        assert!((report.axes[0].initial_magnitude - 75.0).abs() < 10.0);
    }

    #[test]
    fn test_slow_encoder_rejected() {
        let cfg = SimConfig {
            encoder_period: 0.001,
            ..SimConfig::default()
        };
        let sim = SimMachine::new(cfg);
        let config = r#"{
            "kinematics": "cartesian",
            "axes": ["x"],
            "axis": { "x": { "stepper": { "rotation_distance": 40, "position_max": 300 }, "encoder_chip": "encoder_x" } }
        }"#;
        let plan = SyncConfig::from_json(config).unwrap().configure().unwrap();
        let err = MotorsSync::attach(plan, sim, Box::new(MemoryReporter::default()))
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_unknown_accelerometer_rejected() {
        let sim = SimMachine::new(SimConfig::default());
        let plan = SyncConfig::from_json(&ACCEL_COREXY.replace("adxl345", "lis2dw"))
            .unwrap()
            .configure()
            .unwrap();
        assert!(MotorsSync::attach(plan, sim, Box::new(MemoryReporter::default())).is_err());
    }

    #[test]
    fn test_calibration_sweep_on_accelerometer() {
        let sim = SimMachine::new(SimConfig::default());
        let (mut sync, _) = attach(ACCEL_COREXY, &sim);
        let samples = sync
            .calibrate(&CalibrateOptions {
                axis: Some("x".to_string()),
                repeats: Some(2),
                peak_point: None,
            })
            .unwrap();
        assert_eq!(samples.chip, "adxl345");
        assert!(samples.y.len() >= 4);
        assert!(*samples.x.last().unwrap() >= 1.0);
        assert!(sim.offset_msteps("x").abs() <= 1.0);
    }
}
