use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::axis::AxisState;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AxisStatus {
    pub name: String,
    pub dim_type: String,
    pub initial_magnitude: f64,
    pub magnitude: f64,
    pub msteps: i64,
    pub microsteps: u32,
    pub retries: u32,
}

impl AxisStatus {
    pub fn from_axis(axis: &AxisState) -> Self {
        Self {
            name: axis.name().to_string(),
            dim_type: axis.dim_type().to_string(),
            initial_magnitude: axis.init_magnitude,
            magnitude: axis.magnitude,
            msteps: axis.actual_msteps,
            microsteps: axis.config.microsteps,
            retries: axis.curr_retry,
        }
    }
}

/// Outcome of the last synchronization, exported for front ends
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SyncStatus {
    pub timestamp: f64,
    pub applied: bool,
    pub last_result: Option<String>,
    pub axes: Vec<AxisStatus>,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            ..Self::default()
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn record(&mut self, result: &str, axes: Vec<AxisStatus>) {
        self.timestamp = current_timestamp();
        self.applied = true;
        self.last_result = Some(result.to_string());
        self.axes = axes;
    }

    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
