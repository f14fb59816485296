//! Scripted collaborators for controller scenarios.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::axis::AxisState;
use crate::config::{AxisPlan, SensorPlan, StepperGeometry};
use crate::error::{SyncError, SyncResult};
use crate::extract::{ChipKind, DeviationSensor, DirectionStrategy};
use crate::filters::ChipFilter;
use crate::host::{
    AccelChip, EncoderChip, MotionHost, Reactor, Reporter, SensorHub, StepperInfo,
};
use crate::model::StepModel;

#[derive(Debug, Default)]
pub struct SensorCalls {
    pub starts: u32,
    pub finishes: u32,
    pub measurements: u32,
    pub windows: Vec<(Option<f64>, Option<f64>)>,
}

pub type SensorHandle = Rc<RefCell<SensorCalls>>;

/// Returns queued readings in order, repeating the last one when exhausted
pub struct ScriptedSensor {
    readings: VecDeque<f64>,
    last: f64,
    strategy: DirectionStrategy,
    raw: f64,
    window: (Option<f64>, Option<f64>),
    calls: SensorHandle,
    /// Measurement (1-based) that times out instead of returning a reading
    timeout_at: Option<u32>,
}

impl ScriptedSensor {
    pub fn new(readings: &[f64]) -> Self {
        Self {
            readings: readings.iter().copied().collect(),
            last: 0.0,
            strategy: DirectionStrategy::Probe,
            raw: 0.0,
            window: (None, None),
            calls: SensorHandle::default(),
            timeout_at: None,
        }
    }

    /// Readings are signed deviations; direction follows their sign
    pub fn signed(readings: &[f64]) -> Self {
        Self {
            strategy: DirectionStrategy::Sign,
            ..Self::new(readings)
        }
    }

    /// Time out on the `n`-th measurement
    pub fn timing_out_at(mut self, n: u32) -> Self {
        self.timeout_at = Some(n);
        self
    }

    pub fn calls(&self) -> SensorHandle {
        Rc::clone(&self.calls)
    }
}

impl DeviationSensor for ScriptedSensor {
    fn chip_name(&self) -> &str {
        "scripted"
    }

    fn kind(&self) -> ChipKind {
        match self.strategy {
            DirectionStrategy::Probe => ChipKind::Accelerometer,
            DirectionStrategy::Sign => ChipKind::Encoder,
        }
    }

    fn dim_type(&self) -> &'static str {
        "magnitude"
    }

    fn direction_strategy(&self) -> DirectionStrategy {
        self.strategy
    }

    fn start_measurements(&mut self) -> SyncResult<()> {
        self.calls.borrow_mut().starts += 1;
        Ok(())
    }

    fn finish_measurements(&mut self) -> SyncResult<()> {
        self.calls.borrow_mut().finishes += 1;
        Ok(())
    }

    fn flush_data(&mut self) {
        self.window = (None, None);
    }

    fn set_window_start(&mut self, print_time: f64) {
        self.window.0 = Some(print_time);
    }

    fn set_window_end(&mut self, print_time: f64) {
        self.window.1 = Some(print_time);
    }

    fn calc_deviation(&mut self, _reactor: &mut dyn Reactor) -> SyncResult<f64> {
        if let Some(next) = self.readings.pop_front() {
            self.last = next;
        }
        let mut calls = self.calls.borrow_mut();
        calls.measurements += 1;
        calls.windows.push(self.window);
        if self.timeout_at == Some(calls.measurements) {
            return Err(SyncError::SensorTimeout {
                sensor: "scripted".to_string(),
            });
        }
        self.raw = self.last;
        Ok(self.last.abs())
    }

    fn raw_deviation(&self) -> f64 {
        self.raw
    }
}

pub fn scripted_plan(name: &str) -> AxisPlan {
    AxisPlan {
        name: name.to_string(),
        joint_axes: Vec::new(),
        geometry: StepperGeometry {
            rotation_distance: 40.0,
            full_steps_per_rotation: 200,
            position_min: 0.0,
            position_max: 300.0,
        },
        microsteps: 16,
        model: StepModel::Linear { a: 20000.0, b: 0.0 },
        max_step_size: 3,
        axes_steps_diff: 4,
        retry_tolerance: 0.0,
        max_retries: 0,
        sensor: SensorPlan::Accelerometer {
            chip: "scripted".to_string(),
        },
        filter: ChipFilter::Identity,
        head_fan: None,
        buzz: false,
    }
}

pub fn scripted_axis(name: &str, sensor: ScriptedSensor) -> (AxisState, SensorHandle) {
    scripted_axis_with(name, sensor, |_| {})
}

pub fn scripted_axis_with(
    name: &str,
    sensor: ScriptedSensor,
    patch: impl FnOnce(&mut AxisPlan),
) -> (AxisState, SensorHandle) {
    let mut plan = scripted_plan(name);
    patch(&mut plan);
    let calls = sensor.calls();
    let steppers = [format!("stepper_{}", name), format!("stepper_{}1", name)];
    (AxisState::new(plan, steppers, Box::new(sensor)), calls)
}

/// Motion host that only records what was asked of it
#[derive(Debug, Default)]
pub struct TestHost {
    pub clock: f64,
    pub print_time: f64,
    pub moves: Vec<(String, f64)>,
    pub enables: Vec<(String, bool)>,
    pub fans: Vec<(String, bool)>,
    pub homed: String,
    pub homings: u32,
    pub travels: u32,
    /// Switching a fan back on fails
    pub fail_fan_on: bool,
}

impl TestHost {
    /// Net signed distance commanded on one stepper
    pub fn net_move(&self, stepper: &str) -> f64 {
        self.moves
            .iter()
            .filter(|(name, _)| name == stepper)
            .map(|(_, dist)| dist)
            .sum()
    }

    pub fn moves_of(&self, stepper: &str) -> usize {
        self.moves.iter().filter(|(name, _)| name == stepper).count()
    }
}

impl Reactor for TestHost {
    fn monotonic(&self) -> f64 {
        self.clock
    }

    fn pause(&mut self, until: f64) {
        self.clock = until;
    }
}

impl MotionHost for TestHost {
    fn dwell(&mut self, delay: f64) -> SyncResult<()> {
        self.print_time += delay;
        Ok(())
    }

    fn last_move_time(&self) -> f64 {
        self.print_time
    }

    fn set_stepper_enable(&mut self, stepper: &str, enable: bool, _print_time: f64) -> SyncResult<()> {
        self.enables.push((stepper.to_string(), enable));
        Ok(())
    }

    fn manual_move(&mut self, stepper: &str, dist: f64, _speed: f64, _accel: f64) -> SyncResult<()> {
        self.moves.push((stepper.to_string(), dist));
        self.print_time += 0.01;
        Ok(())
    }

    fn wait_moves(&mut self) -> SyncResult<()> {
        Ok(())
    }

    fn axis_steppers(&self, axis: &str) -> Vec<StepperInfo> {
        vec![
            StepperInfo::new(format!("stepper_{}", axis), 16),
            StepperInfo::new(format!("stepper_{}1", axis), 16),
        ]
    }

    fn homed_axes(&self) -> String {
        self.homed.clone()
    }

    fn home(&mut self, axes: &[String]) -> SyncResult<()> {
        self.homings += 1;
        self.homed = axes.concat();
        Ok(())
    }

    fn travel_to(&mut self, _targets: &[(String, f64)], _speed: f64) -> SyncResult<()> {
        self.travels += 1;
        Ok(())
    }

    fn max_velocity(&self) -> f64 {
        300.0
    }

    fn max_accel(&self) -> f64 {
        10000.0
    }

    fn set_fan(&mut self, fan: &str, on: bool) -> SyncResult<()> {
        if on && self.fail_fan_on {
            return Err(SyncError::Host(format!("fan '{}' not responding", fan)));
        }
        self.fans.push((fan.to_string(), on));
        Ok(())
    }
}

impl SensorHub for TestHost {
    fn accelerometer(&mut self, name: &str) -> SyncResult<AccelChip> {
        Err(SyncError::Host(format!("no accelerometer '{}'", name)))
    }

    fn encoder(&mut self, name: &str) -> SyncResult<EncoderChip> {
        Err(SyncError::Host(format!("no encoder '{}'", name)))
    }
}

/// Keeps every reported message
#[derive(Clone, Default)]
pub struct MemoryReporter {
    pub messages: Rc<RefCell<Vec<String>>>,
}

impl MemoryReporter {
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.borrow().iter().any(|m| m.contains(needle))
    }
}

impl Reporter for MemoryReporter {
    fn respond_info(&mut self, msg: &str) {
        self.messages.borrow_mut().push(msg.to_string());
    }
}
