//! Phase synchronization of belt axes driven by two stepper motors.
//!
//! The controller excites an axis by toggling its main stepper, extracts a
//! deviation from an accelerometer or an angle encoder and shifts the second
//! stepper by microsteps until the deviation stops improving.

pub mod axis;
pub mod calibrate;
pub mod config;
pub mod controller;
pub mod error;
pub mod extract;
pub mod filters;
pub mod host;
pub mod model;
pub mod sim;
pub mod stats;
pub mod status;
pub mod types;

#[cfg(test)]
mod testing;

pub use calibrate::{CalibrateOptions, CalibrationSamples};
pub use config::{SyncConfig, SyncMethod, SyncPlan};
pub use controller::{MotorsSync, RunOptions, RunReport, SyncState};
pub use error::{SyncError, SyncResult};
pub use host::{LogReporter, MotionHost, Reporter, SensorHub};
pub use model::StepModel;
pub use sim::{SimConfig, SimMachine};
pub use stats::StatsStore;
pub use status::SyncStatus;
