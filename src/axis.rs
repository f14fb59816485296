use crate::config::AxisPlan;
use crate::extract::DeviationSensor;
use crate::types::MoveDirection;

/// Microsteps of the first direction probe before clamping to the step limit
pub const PROBE_MSTEPS: i64 = 2;

/// One (deviation, cumulative microstep offset) pair per measurement
pub type LogEntry = (i64, i64);

/// Per-axis record: calibration from the plan plus the run state of one
/// synchronization.
pub struct AxisState {
    pub config: AxisPlan,
    /// Main stepper first; the second stepper carries every correction
    pub steppers: [String; 2],
    pub sensor: Box<dyn DeviationSensor>,

    // ===== Run state =====
    pub move_dir: MoveDirection,
    pub move_msteps: i64,
    /// Signed offset since run start
    pub actual_msteps: i64,
    /// Signed offset since the last neighbor re-check
    pub check_msteps: i64,
    pub init_magnitude: f64,
    pub magnitude: f64,
    pub new_magnitude: f64,
    pub curr_retry: u32,
    pub is_finished: bool,
    /// True between sensor session start and finalization
    pub measuring: bool,
    pub log: Vec<LogEntry>,
}

impl AxisState {
    pub fn new(config: AxisPlan, steppers: [String; 2], sensor: Box<dyn DeviationSensor>) -> Self {
        Self {
            config,
            steppers,
            sensor,
            move_dir: MoveDirection::Unknown,
            move_msteps: PROBE_MSTEPS,
            actual_msteps: 0,
            check_msteps: 0,
            init_magnitude: 0.0,
            magnitude: 0.0,
            new_magnitude: 0.0,
            curr_retry: 0,
            is_finished: false,
            measuring: false,
            log: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn label(&self) -> String {
        self.config.name.to_uppercase()
    }

    pub fn main_stepper(&self) -> &str {
        &self.steppers[0]
    }

    pub fn second_stepper(&self) -> &str {
        &self.steppers[1]
    }

    pub fn swap_steppers(&mut self) {
        self.steppers.swap(0, 1);
    }

    /// Reset everything but calibration before a run
    pub fn flush_motion_data(&mut self) {
        self.move_dir = MoveDirection::Unknown;
        self.move_msteps = PROBE_MSTEPS;
        self.actual_msteps = 0;
        self.check_msteps = 0;
        self.init_magnitude = 0.0;
        self.magnitude = 0.0;
        self.new_magnitude = 0.0;
        self.curr_retry = 0;
        self.is_finished = false;
        self.log.clear();
    }

    pub fn update_log(&mut self, deviation: f64) {
        self.log.push((deviation as i64, self.actual_msteps));
    }

    /// Record a move of `msteps` on the second stepper
    pub fn apply_move(&mut self, msteps: i64) {
        self.actual_msteps += msteps;
        self.check_msteps += msteps;
    }

    /// Model prediction for `fx`, or for the latest measurement
    pub fn solve_steps(&self, fx: Option<f64>) -> f64 {
        self.config.model.solve(fx.unwrap_or(self.new_magnitude))
    }

    /// Turn a model prediction into a move size in `1..=max_step_size`
    pub fn clamp_steps(&self, prediction: f64) -> i64 {
        let max_step = i64::from(self.config.max_step_size);
        if prediction.is_nan() {
            return 1;
        }
        if prediction.is_infinite() {
            return if prediction > 0.0 { max_step } else { 1 };
        }
        (prediction.round() as i64).clamp(1, max_step)
    }

    /// Step divergence between this axis and a coupled neighbor
    pub fn steps_divergence(&self, other: &AxisState) -> i64 {
        (self.check_msteps.abs() - other.check_msteps.abs()).abs()
    }

    pub fn below_tolerance(&self, magnitude: f64) -> bool {
        self.config.retry_tolerance > 0.0 && magnitude < self.config.retry_tolerance
    }

    pub fn dim_type(&self) -> &'static str {
        self.sensor.dim_type()
    }
}
