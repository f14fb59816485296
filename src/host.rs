//! Collaborator interfaces the synchronization core is driven through.
//!
//! The controller never touches hardware directly: motion goes through a
//! [`MotionHost`], sensor chips are looked up on a [`SensorHub`], raw samples
//! arrive from a [`SampleSource`] and progress text leaves through a
//! [`Reporter`].

use crate::error::SyncResult;
use crate::types::{AccelSample, PositionSample, Timestamped};

/// Minimum wait time to toggle a hardware pin (s)
pub const PIN_MIN_TIME: f64 = 0.010;
/// Minimum wait time around a motor enable pin change (s)
pub const MOTOR_STALL_TIME: f64 = 0.100;

/// Event loop clock. `pause` is the only suspension point of a run.
pub trait Reactor {
    fn monotonic(&self) -> f64;
    fn pause(&mut self, until: f64);
}

/// Stepper owned by a kinematic axis
#[derive(Clone, Debug, PartialEq)]
pub struct StepperInfo {
    pub name: String,
    pub microsteps: u32,
}

impl StepperInfo {
    pub fn new(name: impl Into<String>, microsteps: u32) -> Self {
        Self {
            name: name.into(),
            microsteps,
        }
    }
}

pub trait MotionHost: Reactor {
    /// Append an idle period to the motion queue
    fn dwell(&mut self, delay: f64) -> SyncResult<()>;

    /// Print time at the end of the queued motion
    fn last_move_time(&self) -> f64;

    fn set_stepper_enable(&mut self, stepper: &str, enable: bool, print_time: f64)
        -> SyncResult<()>;

    /// Move a single stepper by `dist` mm, bypassing kinematics
    fn manual_move(&mut self, stepper: &str, dist: f64, speed: f64, accel: f64)
        -> SyncResult<()>;

    fn wait_moves(&mut self) -> SyncResult<()>;

    /// Kinematic steppers whose name belongs to `axis`, main stepper first
    fn axis_steppers(&self, axis: &str) -> Vec<StepperInfo>;

    /// Homed axes as a lowercase string, e.g. `"xy"`
    fn homed_axes(&self) -> String;

    fn home(&mut self, axes: &[String]) -> SyncResult<()>;

    fn travel_to(&mut self, targets: &[(String, f64)], speed: f64) -> SyncResult<()>;

    fn max_velocity(&self) -> f64;

    fn max_accel(&self) -> f64;

    /// Switch a head fan off for a measurement and restore it afterwards.
    /// Machines without controllable fans keep the default no-op.
    fn set_fan(&mut self, _fan: &str, _on: bool) -> SyncResult<()> {
        Ok(())
    }
}

/// Buffered raw sample delivery from one sensor chip
pub trait SampleSource {
    type Sample: Timestamped;

    fn start_session(&mut self) -> SyncResult<()>;

    fn finish_session(&mut self) -> SyncResult<()>;

    /// Drop everything delivered so far
    fn clear(&mut self);

    /// Move newly delivered samples into `out`, returns how many were added
    fn drain_into(&mut self, out: &mut Vec<Self::Sample>) -> usize;
}

pub type AccelSource = Box<dyn SampleSource<Sample = AccelSample>>;
pub type PositionSource = Box<dyn SampleSource<Sample = PositionSample>>;

pub struct AccelChip {
    pub source: AccelSource,
    /// Native output rate (Hz), `None` when the driver does not expose it
    pub data_rate: Option<f64>,
}

pub struct EncoderChip {
    pub source: PositionSource,
    /// Sampling period (s)
    pub sample_period: f64,
    /// Stepper the encoder is calibrated against
    pub bound_stepper: String,
}

pub trait SensorHub {
    fn accelerometer(&mut self, name: &str) -> SyncResult<AccelChip>;
    fn encoder(&mut self, name: &str) -> SyncResult<EncoderChip>;
}

/// Sink for user facing progress messages
pub trait Reporter {
    fn respond_info(&mut self, msg: &str);
}

/// Forwards every message to the `log` facade
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn respond_info(&mut self, msg: &str) {
        log::info!("{}", msg);
    }
}
