//! Closed-loop phase synchronization of dual-motor axes.
//!
//! Every correction cycle excites the axis by toggling the main stepper,
//! measures the resulting deviation, predicts a microstep correction from the
//! axis model and moves the second stepper. Axes are scheduled one after the
//! other, alternately after a leveling pre-pass, or interleaved.

use std::collections::BTreeMap;

use crate::axis::{AxisState, PROBE_MSTEPS};
use crate::config::{SensorPlan, SyncMethod, SyncPlan};
use crate::error::{SyncError, SyncResult};
use crate::extract::{
    rotary::MIN_SAMPLE_PERIOD, ChipKind, DeviationSensor, DirectionStrategy, RotarySensor,
    VibrationSensor,
};
use crate::host::{MotionHost, Reporter, SensorHub, MOTOR_STALL_TIME, PIN_MIN_TIME};
use crate::stats::{StatsRecord, StatsStore};
use crate::status::{AxisStatus, SyncStatus};
use crate::types::MoveDirection;

/// Magnitude difference the leveling pre-pass aims below
pub const AXES_LEVEL_DELTA: f64 = 2000.0;
/// Relative moves of the buzz before a measurement
pub const BUZZ_MOVES: u32 = 25;
/// Relative moves of the buzz after a measurement
pub const BUZZ_SETTLE_MOVES: u32 = 5;
/// Upper bound of the travel acceleration (mm/s^2)
pub const MAX_TRAVEL_ACCEL: f64 = 5000.0;

// ===== Reported states =====

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Start,
    Static,
    Stepped,
    Direction,
    Retry,
    Done,
    Error,
}

// ===== Run options =====

/// Overrides of one synchronization run. Per-axis values win over globals.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunOptions {
    /// Subset of configured axes, all axes when `None`
    pub axes: Option<Vec<String>>,
    pub accel_chip: Option<String>,
    pub axis_accel_chip: BTreeMap<String, String>,
    pub retry_tolerance: Option<f64>,
    pub axis_retry_tolerance: BTreeMap<String, f64>,
    pub retries: Option<u32>,
    pub axis_retries: BTreeMap<String, u32>,
    /// Correct even when every axis starts in tolerance
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    /// All axes started below their tolerance, nothing was moved
    pub in_tolerance: bool,
    pub axes: Vec<AxisStatus>,
}

pub struct MotorsSync<H> {
    pub(crate) host: H,
    pub(crate) reporter: Box<dyn Reporter>,
    pub(crate) axes: Vec<AxisState>,
    pub(crate) sync_method: SyncMethod,
    pub(crate) travel_speed: f64,
    pub(crate) travel_accel: f64,
    /// Indices into `axes` of the current run
    pub(crate) run_axes: Vec<usize>,
    pub(crate) stats: Option<StatsStore>,
    pub(crate) status: SyncStatus,
}

impl<H: MotionHost + SensorHub> MotorsSync<H> {
    /// Bind a validated plan to the machine and check the hardware against it.
    pub fn attach(plan: SyncPlan, mut host: H, reporter: Box<dyn Reporter>) -> SyncResult<Self> {
        let mut axes = Vec::with_capacity(plan.axes.len());
        for axis_plan in plan.axes {
            let steppers = host.axis_steppers(&axis_plan.name);
            if steppers.len() != 2 {
                return Err(SyncError::Config(format!(
                    "Not support {} count of motors on {} axis",
                    steppers.len(),
                    axis_plan.name
                )));
            }
            for stepper in &steppers {
                if axis_plan.microsteps > stepper.microsteps {
                    return Err(SyncError::Config(format!(
                        "Invalid microsteps count, cannot be more than steppers, {} vs {}",
                        axis_plan.microsteps, stepper.microsteps
                    )));
                }
            }
            let pair = [steppers[0].name.clone(), steppers[1].name.clone()];

            let (sensor, bound_stepper): (Box<dyn DeviationSensor>, Option<String>) =
                match &axis_plan.sensor {
                    SensorPlan::Accelerometer { chip } => {
                        let accel = host.accelerometer(chip)?;
                        let sensor = VibrationSensor::attach(chip, accel, &axis_plan.filter)?;
                        (Box::new(sensor), None)
                    }
                    SensorPlan::Encoder { chip } => {
                        let encoder = host.encoder(chip)?;
                        if encoder.sample_period > MIN_SAMPLE_PERIOD {
                            return Err(SyncError::Config(format!(
                                "Encoder sample rate too low: {} > {}",
                                encoder.sample_period, MIN_SAMPLE_PERIOD
                            )));
                        }
                        let bound = encoder.bound_stepper.clone();
                        let rd = axis_plan.geometry.rotation_distance;
                        (Box::new(RotarySensor::attach(chip, encoder, rd)), Some(bound))
                    }
                };

            let mut axis = AxisState::new(axis_plan, pair, sensor);
            // The encoder must sit on the main stepper
            if bound_stepper.map_or(false, |bound| bound != axis.main_stepper()) {
                axis.swap_steppers();
            }
            log::info!(
                "motors_sync: {} axis on {} / {} with {} '{}'",
                axis.label(),
                axis.main_stepper(),
                axis.second_stepper(),
                axis.sensor.kind().label(),
                axis.sensor.chip_name()
            );
            axes.push(axis);
        }
        Ok(Self::from_axes(host, reporter, plan.sync_method, axes))
    }

    /// Assemble a controller from already bound axes
    pub fn from_axes(
        host: H,
        reporter: Box<dyn Reporter>,
        sync_method: SyncMethod,
        axes: Vec<AxisState>,
    ) -> Self {
        let travel_speed = host.max_velocity() / 2.0;
        let travel_accel = host.max_accel().min(MAX_TRAVEL_ACCEL);
        Self {
            host,
            reporter,
            axes,
            sync_method,
            travel_speed,
            travel_accel,
            run_axes: Vec::new(),
            stats: None,
            status: SyncStatus::new(),
        }
    }

    pub fn with_stats(mut self, stats: StatsStore) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn status(&self) -> &SyncStatus {
        &self.status
    }

    pub fn axes(&self) -> &[AxisState] {
        &self.axes
    }

    pub fn axis(&self, name: &str) -> Option<&AxisState> {
        self.axes.iter().find(|a| a.name() == name)
    }

    pub(crate) fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|a| a.name() == name)
    }

    // ===== Motion helpers =====

    fn toggle_main_stepper(&mut self, idx: usize, enable: bool, ontime: f64, offtime: f64) -> SyncResult<()> {
        self.host.dwell(ontime)?;
        let print_time = self.host.last_move_time();
        let stepper = self.axes[idx].main_stepper().to_string();
        self.host.set_stepper_enable(&stepper, enable, print_time)?;
        self.host.dwell(offtime)
    }

    fn toggle_joint_axes(&mut self, idx: usize, enable: bool) -> SyncResult<()> {
        let steppers: Vec<String> = self.axes[idx]
            .config
            .joint_axes
            .iter()
            .filter_map(|name| self.axis(name))
            .flat_map(|joint| joint.steppers.iter().cloned())
            .collect();
        for stepper in steppers {
            self.host.dwell(PIN_MIN_TIME)?;
            let print_time = self.host.last_move_time();
            self.host.set_stepper_enable(&stepper, enable, print_time)?;
            self.host.dwell(PIN_MIN_TIME)?;
        }
        Ok(())
    }

    fn set_fan(&mut self, idx: usize, on: bool) -> SyncResult<()> {
        match self.axes[idx].config.head_fan.clone() {
            Some(fan) => self.host.set_fan(&fan, on),
            None => Ok(()),
        }
    }

    fn stepper_move(&mut self, stepper: &str, dist: f64) -> SyncResult<()> {
        self.host
            .manual_move(stepper, dist, self.travel_speed, self.travel_accel)
    }

    /// Move the second stepper by `move_msteps` in the axis direction
    /// times `sign`.
    pub(crate) fn single_move(&mut self, idx: usize, sign: i64) -> SyncResult<()> {
        let axis = &mut self.axes[idx];
        let msteps = axis.move_msteps * axis.move_dir.sign() * sign;
        let dist = axis.config.move_d() * msteps as f64;
        axis.apply_move(msteps);
        let stepper = axis.second_stepper().to_string();
        self.stepper_move(&stepper, dist)
    }

    /// Corrective move that fails the run once the axis drifted more than
    /// two full steps from its start.
    ///
    /// This stop comes on top of the retry limit. A real phase mismatch
    /// stays within two full steps, so a larger offset means the model keeps
    /// pushing the second stepper away. Reverts and calibration moves are
    /// not checked.
    fn guarded_move(&mut self, idx: usize, sign: i64) -> SyncResult<()> {
        self.single_move(idx, sign)?;
        let axis = &self.axes[idx];
        let limit = 2 * i64::from(axis.config.microsteps);
        if axis.actual_msteps.abs() > limit {
            return Err(SyncError::Diverged {
                axis: axis.label(),
                msteps: axis.actual_msteps,
            });
        }
        Ok(())
    }

    /// Fading oscillation of the second stepper with the main one released
    fn buzz(&mut self, idx: usize, rel_moves: u32) -> SyncResult<()> {
        self.toggle_main_stepper(idx, false, PIN_MIN_TIME, PIN_MIN_TIME)?;
        let stepper = self.axes[idx].second_stepper().to_string();
        let amplitude = self.axes[idx].config.rel_buzz_d();
        let mut last_pos = 0.0;
        for osc in (0..rel_moves).rev() {
            let mut pos = amplitude * f64::from(osc) / f64::from(rel_moves);
            for inv in [1.0, -1.0] {
                pos *= inv;
                self.stepper_move(&stepper, pos - last_pos)?;
                last_pos = pos;
            }
        }
        Ok(())
    }

    /// Excite the axis and return the extracted deviation
    pub(crate) fn measure(&mut self, idx: usize) -> SyncResult<f64> {
        let buzz = self.axes[idx].config.buzz;
        if buzz {
            self.buzz(idx, BUZZ_MOVES)?;
        }
        self.axes[idx].sensor.flush_data();
        self.toggle_joint_axes(idx, false)?;
        self.toggle_main_stepper(idx, true, PIN_MIN_TIME, MOTOR_STALL_TIME)?;
        self.toggle_main_stepper(idx, false, PIN_MIN_TIME, MOTOR_STALL_TIME)?;
        let start = self.host.last_move_time();
        self.axes[idx].sensor.set_window_start(start);
        self.toggle_main_stepper(idx, true, MOTOR_STALL_TIME, MOTOR_STALL_TIME)?;
        let end = self.host.last_move_time();
        self.axes[idx].sensor.set_window_end(end);
        self.toggle_joint_axes(idx, true)?;
        if buzz {
            self.buzz(idx, BUZZ_SETTLE_MOVES)?;
        } else {
            self.toggle_main_stepper(idx, false, MOTOR_STALL_TIME, MOTOR_STALL_TIME)?;
        }

        let axis = &mut self.axes[idx];
        let deviation = axis.sensor.calc_deviation(&mut self.host)?;
        axis.update_log(deviation);
        log::debug!(
            "motors_sync: {} {} {} at {} msteps",
            axis.label(),
            axis.dim_type(),
            deviation,
            axis.actual_msteps
        );
        Ok(deviation)
    }

    /// Home what is not homed and park the run axes at their centers
    fn homing(&mut self) -> SyncResult<()> {
        let names: Vec<String> = self
            .run_axes
            .iter()
            .map(|&idx| self.axes[idx].name().to_string())
            .collect();
        let homed = self.host.homed_axes();
        if names.iter().any(|name| !homed.contains(name.as_str())) {
            self.host.home(&names)?;
        }
        let centers: Vec<(String, f64)> = self
            .run_axes
            .iter()
            .map(|&idx| (self.axes[idx].name().to_string(), self.axes[idx].config.limits().2))
            .collect();
        self.host.travel_to(&centers, self.travel_speed)?;
        self.host.dwell(MOTOR_STALL_TIME)
    }

    // ===== State handling =====

    fn start_axis(&mut self, idx: usize) -> SyncResult<()> {
        self.axes[idx].flush_motion_data();
        self.set_fan(idx, false)?;
        self.axes[idx].sensor.start_measurements()?;
        self.axes[idx].measuring = true;
        let magnitude = self.measure(idx)?;
        let axis = &mut self.axes[idx];
        axis.init_magnitude = magnitude;
        axis.magnitude = magnitude;
        axis.new_magnitude = magnitude;
        Ok(())
    }

    /// Restore the fan, close the sensor session and hold the main stepper.
    /// Runs at most once per started axis. Every step is attempted even when
    /// an earlier one fails; the first error is returned.
    pub(crate) fn finalize_axis(&mut self, idx: usize) -> SyncResult<()> {
        if !self.axes[idx].measuring {
            return Ok(());
        }
        let fan = self.set_fan(idx, true);
        let waited = self.host.wait_moves();
        let finished = self.axes[idx].sensor.finish_measurements();
        let held = self.toggle_main_stepper(idx, true, PIN_MIN_TIME, PIN_MIN_TIME);
        self.axes[idx].measuring = false;
        fan.and(waited).and(finished).and(held)
    }

    pub(crate) fn finalize_run_axes(&mut self) {
        for idx in self.run_axes.clone() {
            if let Err(e) = self.finalize_axis(idx) {
                log::warn!("motors_sync: cleanup of {} axis failed: {}", self.axes[idx].label(), e);
            }
        }
    }

    pub(crate) fn handle_state(&mut self, idx: usize, state: SyncState) -> SyncResult<()> {
        if state == SyncState::Start {
            self.start_axis(idx)?;
        }
        if state == SyncState::Done {
            self.finalize_axis(idx)?;
        }

        let axis = &mut self.axes[idx];
        let name = axis.label();
        let dim_type = axis.dim_type();
        let msg = match state {
            SyncState::Start => format!("{}-Initial {}: {}", name, dim_type, axis.init_magnitude),
            SyncState::Static => format!("{}-New {}: {}", name, dim_type, axis.new_magnitude),
            SyncState::Stepped => format!(
                "{}-New {}: {} on {}/{} step move",
                name,
                dim_type,
                axis.new_magnitude,
                axis.move_msteps * axis.move_dir.sign(),
                axis.config.microsteps
            ),
            SyncState::Direction => {
                format!("{}-Movement direction: {}", name, axis.move_dir.label())
            }
            SyncState::Retry => {
                axis.move_dir = MoveDirection::Unknown;
                format!(
                    "{}-Retries: {}/{} Back on last {}: {} on {}/{} step to reach {}",
                    name,
                    axis.curr_retry,
                    axis.config.max_retries,
                    dim_type,
                    axis.magnitude,
                    axis.actual_msteps,
                    axis.config.microsteps,
                    axis.config.retry_tolerance
                )
            }
            SyncState::Done => format!(
                "{}-Motors adjusted by {}/{} step, {} {} --> {}",
                name,
                axis.actual_msteps,
                axis.config.microsteps,
                dim_type,
                axis.init_magnitude,
                axis.magnitude
            ),
            SyncState::Error => {
                let err = SyncError::TooManyRetries {
                    axis: name,
                    retries: axis.config.max_retries,
                };
                self.finalize_run_axes();
                return Err(err);
            }
        };
        self.reporter.respond_info(&msg);
        Ok(())
    }

    /// Count a failed attempt; past the limit the run is aborted
    fn escalate_retry(&mut self, idx: usize) -> SyncResult<()> {
        self.axes[idx].curr_retry += 1;
        if self.axes[idx].curr_retry > self.axes[idx].config.max_retries {
            self.write_stats(Some(idx));
            self.handle_state(idx, SyncState::Done)?;
            return self.handle_state(idx, SyncState::Error);
        }
        self.handle_state(idx, SyncState::Retry)
    }

    // ===== Convergence =====

    pub(crate) fn detect_move_dir(&mut self, idx: usize) -> SyncResult<()> {
        match self.axes[idx].sensor.direction_strategy() {
            DirectionStrategy::Probe => {
                let axis = &mut self.axes[idx];
                axis.move_dir = MoveDirection::Unknown;
                axis.move_msteps = PROBE_MSTEPS.min(i64::from(axis.config.max_step_size));
                self.guarded_move(idx, 1)?;
                let reading = self.measure(idx)?;
                self.axes[idx].new_magnitude = reading;
                self.handle_state(idx, SyncState::Stepped)?;
                let axis = &mut self.axes[idx];
                axis.move_dir = if axis.new_magnitude > axis.magnitude {
                    MoveDirection::Backward
                } else {
                    MoveDirection::Forward
                };
                self.handle_state(idx, SyncState::Direction)?;
                let axis = &mut self.axes[idx];
                axis.magnitude = axis.new_magnitude;
            }
            DirectionStrategy::Sign => {
                let axis = &mut self.axes[idx];
                axis.move_dir = if axis.sensor.raw_deviation() < 0.0 {
                    MoveDirection::Backward
                } else {
                    MoveDirection::Forward
                };
                axis.new_magnitude = axis.magnitude;
                self.handle_state(idx, SyncState::Direction)?;
            }
        }
        Ok(())
    }

    /// One correction attempt, or a plain re-measure in check mode
    pub(crate) fn single_sync(&mut self, idx: usize, check_axis: bool) -> SyncResult<()> {
        if check_axis {
            let reading = self.measure(idx)?;
            self.axes[idx].new_magnitude = reading;
            self.handle_state(idx, SyncState::Static)?;
            self.axes[idx].magnitude = reading;
            return Ok(());
        }

        if self.axes[idx].move_dir.is_unknown() {
            let axis = &self.axes[idx];
            if axis.actual_msteps == 0 || axis.curr_retry > 0 {
                let reading = self.measure(idx)?;
                let axis = &mut self.axes[idx];
                axis.new_magnitude = reading;
                axis.magnitude = reading;
                self.handle_state(idx, SyncState::Static)?;
            }
            let axis = &mut self.axes[idx];
            if axis.actual_msteps == 0 && axis.below_tolerance(axis.new_magnitude) {
                axis.is_finished = true;
                return Ok(());
            }
            self.detect_move_dir(idx)?;
        }

        let axis = &mut self.axes[idx];
        axis.move_msteps = axis.clamp_steps(axis.solve_steps(None));
        self.guarded_move(idx, 1)?;
        let reading = self.measure(idx)?;
        self.axes[idx].new_magnitude = reading;
        self.handle_state(idx, SyncState::Stepped)?;

        let axis = &self.axes[idx];
        if axis.new_magnitude > axis.magnitude {
            self.single_move(idx, -1)?;
            let axis = &self.axes[idx];
            let tolerance = axis.config.retry_tolerance;
            if tolerance > 0.0 && axis.magnitude > tolerance {
                return self.escalate_retry(idx);
            }
            self.axes[idx].is_finished = true;
            return Ok(());
        }
        let axis = &mut self.axes[idx];
        axis.magnitude = axis.new_magnitude;
        Ok(())
    }

    /// Bring the main axis magnitude close to the secondary one
    pub(crate) fn axes_level(&mut self, m: usize, s: usize) -> SyncResult<()> {
        let delta = self.axes[m].init_magnitude - self.axes[s].init_magnitude;
        if delta <= AXES_LEVEL_DELTA {
            return Ok(());
        }
        self.reporter
            .respond_info(&format!("Start axes level, delta: {:.2}", delta));

        loop {
            let steps_diff = self.axes[m].steps_divergence(&self.axes[s]);
            if steps_diff >= i64::from(self.axes[m].config.axes_steps_diff) {
                let reading = self.measure(s)?;
                let sec = &mut self.axes[s];
                sec.new_magnitude = reading;
                sec.magnitude = reading;
                self.handle_state(s, SyncState::Static)?;
                self.axes[m].check_msteps = 0;
                self.axes[s].check_msteps = 0;
            }
            if self.axes[m].move_dir.is_unknown() {
                self.detect_move_dir(m)?;
            }

            let sec_magnitude = self.axes[s].magnitude;
            let main = &mut self.axes[m];
            let prediction = main.solve_steps(None) - main.solve_steps(Some(sec_magnitude));
            main.move_msteps = main.clamp_steps(prediction);
            self.guarded_move(m, 1)?;
            let reading = self.measure(m)?;
            self.axes[m].new_magnitude = reading;
            self.handle_state(m, SyncState::Stepped)?;

            let mut force_exit = false;
            if self.axes[m].new_magnitude > self.axes[m].magnitude {
                self.single_move(m, -1)?;
                let main = &self.axes[m];
                let tolerance = main.config.retry_tolerance;
                if tolerance > 0.0 && main.magnitude > tolerance {
                    self.escalate_retry(m)?;
                    continue;
                }
                force_exit = true;
            } else {
                let main = &mut self.axes[m];
                main.magnitude = main.new_magnitude;
            }

            let (main, sec) = (&self.axes[m], &self.axes[s]);
            let delta = main.magnitude - sec.magnitude;
            if delta < AXES_LEVEL_DELTA || main.magnitude < sec.magnitude || force_exit {
                let msg = format!(
                    "Axes are leveled: {}: {} --> {}, {}: {} --> {}, delta: {:.2}",
                    main.label(),
                    main.init_magnitude,
                    main.magnitude,
                    sec.label(),
                    sec.init_magnitude,
                    sec.magnitude,
                    delta
                );
                self.reporter.respond_info(&msg);
                return Ok(());
            }
        }
    }

    fn all_finished(&self, order: &[usize]) -> bool {
        order.iter().all(|&idx| self.axes[idx].is_finished)
    }

    pub(crate) fn run_sync(&mut self) -> SyncResult<()> {
        let order = self.run_axes.clone();
        let method = if order.len() < 2 {
            SyncMethod::Sequential
        } else {
            self.sync_method
        };
        match method {
            SyncMethod::Sequential => self.run_sequential(&order),
            SyncMethod::Alternately => self.run_alternately(&order),
            SyncMethod::Synchronous => self.run_synchronous(&order),
        }
    }

    fn run_sequential(&mut self, order: &[usize]) -> SyncResult<()> {
        for &idx in order {
            let axis = &mut self.axes[idx];
            if axis.below_tolerance(axis.magnitude) {
                axis.is_finished = true;
                continue;
            }
            self.detect_move_dir(idx)?;
            while !self.axes[idx].is_finished {
                self.single_sync(idx, false)?;
            }
        }
        Ok(())
    }

    fn run_alternately(&mut self, order: &[usize]) -> SyncResult<()> {
        let mut by_init = order.to_vec();
        by_init.sort_by(|a, b| {
            self.axes[*a]
                .init_magnitude
                .total_cmp(&self.axes[*b].init_magnitude)
        });
        let (min_ax, max_ax) = (by_init[0], by_init[by_init.len() - 1]);
        self.axes_level(max_ax, min_ax)?;

        // Lower axis first
        let cycle = [min_ax, max_ax];
        while !self.all_finished(&cycle) {
            for &idx in &cycle {
                if !self.axes[idx].is_finished {
                    self.single_sync(idx, false)?;
                }
            }
        }
        Ok(())
    }

    fn run_synchronous(&mut self, order: &[usize]) -> SyncResult<()> {
        let max_ax = order
            .iter()
            .copied()
            .max_by(|a, b| {
                self.axes[*a]
                    .init_magnitude
                    .total_cmp(&self.axes[*b].init_magnitude)
            })
            .unwrap_or(order[0]);
        self.detect_move_dir(max_ax)?;

        let mut pos = 0;
        while !self.all_finished(order) {
            let m = order[pos % order.len()];
            let s = order[(pos + 1) % order.len()];
            pos += 1;
            if self.axes[m].is_finished {
                continue;
            }
            let mut check_axis = false;
            if self.axes[m].magnitude < self.axes[s].magnitude && !self.axes[s].is_finished {
                let steps_diff = self.axes[m].steps_divergence(&self.axes[s]);
                if steps_diff < i64::from(self.axes[m].config.axes_steps_diff) {
                    continue;
                }
                check_axis = true;
                self.axes[m].check_msteps = 0;
                self.axes[s].check_msteps = 0;
            }
            self.single_sync(m, check_axis)?;
        }
        Ok(())
    }

    // ===== Entry point =====

    fn resolve_axes(&self, axes: Option<&[String]>) -> SyncResult<Vec<usize>> {
        match axes {
            None => Ok((0..self.axes.len()).collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.axis_index(&name.to_lowercase()).ok_or_else(|| {
                        SyncError::InvalidArgument(format!("Invalid axes parameter '{}'", name))
                    })
                })
                .collect(),
        }
    }

    fn apply_overrides(&mut self, opts: &RunOptions) -> SyncResult<()> {
        for idx in self.run_axes.clone() {
            let name = self.axes[idx].name().to_string();

            let chip = opts
                .axis_accel_chip
                .get(&name)
                .or(opts.accel_chip.as_ref())
                .map(|c| c.to_lowercase());
            if let Some(chip) = chip {
                let axis = &self.axes[idx];
                if axis.sensor.kind() == ChipKind::Accelerometer && chip != axis.sensor.chip_name() {
                    let accel = self.host.accelerometer(&chip)?;
                    let sensor = VibrationSensor::attach(&chip, accel, &axis.config.filter)?;
                    let axis = &mut self.axes[idx];
                    axis.sensor = Box::new(sensor);
                    axis.config.sensor = SensorPlan::Accelerometer { chip };
                }
            }

            let tolerance = opts
                .axis_retry_tolerance
                .get(&name)
                .copied()
                .or(opts.retry_tolerance)
                .filter(|t| *t > 0.0);
            if let Some(tolerance) = tolerance {
                self.axes[idx].config.retry_tolerance = tolerance;
            }
            let retries = opts
                .axis_retries
                .get(&name)
                .copied()
                .or(opts.retries)
                .filter(|r| *r > 0);
            if let Some(retries) = retries {
                self.axes[idx].config.max_retries = retries;
            }
        }
        Ok(())
    }

    /// Synchronize the selected axes. On any error every axis started in
    /// the run is finalized before the error is returned.
    pub fn run(&mut self, opts: &RunOptions) -> SyncResult<RunReport> {
        let run_axes = self.resolve_axes(opts.axes.as_deref())?;
        self.run_axes = run_axes;
        self.apply_overrides(opts)?;
        self.status.reset();

        let result = self.run_inner(opts.force);
        if let Err(e) = &result {
            log::warn!("motors_sync: synchronization aborted: {}", e);
            self.finalize_run_axes();
        }
        result
    }

    fn run_inner(&mut self, force: bool) -> SyncResult<RunReport> {
        self.homing()?;
        self.reporter.respond_info("Motors synchronization started");
        for idx in self.run_axes.clone() {
            self.handle_state(idx, SyncState::Start)?;
        }

        let in_tolerance = !force
            && self.run_axes.iter().all(|&idx| {
                let axis = &self.axes[idx];
                axis.init_magnitude < axis.config.retry_tolerance
            });
        if in_tolerance {
            let mut tolerances = Vec::new();
            for idx in self.run_axes.clone() {
                self.finalize_axis(idx)?;
                let axis = &self.axes[idx];
                tolerances.push(format!("{}: {}", axis.label(), axis.config.retry_tolerance));
            }
            self.reporter.respond_info(&format!(
                "Motors magnitudes are in tolerance: {}",
                tolerances.join(", ")
            ));
        } else {
            self.run_sync()?;
            for idx in self.run_axes.clone() {
                self.handle_state(idx, SyncState::Done)?;
            }
            self.write_stats(None);
        }

        let axes: Vec<AxisStatus> = self
            .run_axes
            .iter()
            .map(|&idx| AxisStatus::from_axis(&self.axes[idx]))
            .collect();
        self.status.record("done", axes.clone());
        Ok(RunReport { in_tolerance, axes })
    }

    /// Record the failed axis, or every moved run axis after a success
    fn write_stats(&mut self, failed: Option<usize>) {
        let Some(stats) = &self.stats else {
            return;
        };
        let (targets, success) = match failed {
            Some(idx) => (vec![idx], false),
            None => (self.run_axes.clone(), true),
        };
        for idx in targets {
            if let Some(record) = StatsRecord::from_axis(&self.axes[idx], success) {
                if let Err(e) = stats.append(&record) {
                    log::warn!("motors_sync: cannot write statistics: {}", e);
                }
            }
        }
    }
}
