//! Calibration sweep: samples of magnitude against microstep offset for the
//! offline model fit.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::controller::{MotorsSync, RunOptions, SyncState};
use crate::error::{SyncError, SyncResult};
use crate::host::{MotionHost, SensorHub};
use crate::types::MoveDirection;

pub const MIN_REPEATS: u32 = 2;
pub const MAX_REPEATS: u32 = 100;
pub const DEFAULT_REPEATS: u32 = 10;
/// Default peak magnitude per mm of rotation distance
pub const PEAK_POINT_PER_RD: f64 = 1250.0;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalibrateOptions {
    /// Axis to sweep, the first configured axis when `None`
    pub axis: Option<String>,
    pub repeats: Option<u32>,
    pub peak_point: Option<f64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CalibrationSamples {
    pub axis: String,
    pub chip: String,
    pub microsteps: u32,
    /// Microstep offsets, evenly spaced
    pub x: Vec<f64>,
    /// Sorted magnitudes
    pub y: Vec<f64>,
}

impl CalibrationSamples {
    pub fn save(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// `count` values evenly spaced over `[start, stop]`
fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (count - 1) as f64;
            (0..count).map(|i| start + step * i as f64).collect()
        }
    }
}

impl<H: MotionHost + SensorHub> MotorsSync<H> {
    /// Synchronize one axis, then repeatedly push its magnitude up to the
    /// peak and back down one microstep at a time.
    pub fn calibrate(&mut self, opts: &CalibrateOptions) -> SyncResult<CalibrationSamples> {
        let repeats = opts.repeats.unwrap_or(DEFAULT_REPEATS);
        if !(MIN_REPEATS..=MAX_REPEATS).contains(&repeats) {
            return Err(SyncError::InvalidArgument(format!(
                "REPEATS must be within {}..={}, got {}",
                MIN_REPEATS, MAX_REPEATS, repeats
            )));
        }
        let idx = match &opts.axis {
            Some(name) => self.axis_index(&name.to_lowercase()).ok_or_else(|| {
                SyncError::InvalidArgument(format!("Invalid axis parameter '{}'", name))
            })?,
            None if !self.axes.is_empty() => 0,
            None => return Err(SyncError::Config("no axes configured".to_string())),
        };
        let name = self.axes[idx].name().to_string();
        let peak_point = opts
            .peak_point
            .unwrap_or(self.axes[idx].config.geometry.rotation_distance * PEAK_POINT_PER_RD);

        self.reporter.respond_info(&format!(
            "Calibration started on {} axis with {} repeats, magnitude 0 --> {}",
            name, repeats, peak_point
        ));
        self.reporter.respond_info("Synchronizing before calibration...");
        self.run(&RunOptions {
            axes: Some(vec![name]),
            force: true,
            ..RunOptions::default()
        })?;

        self.run_axes = vec![idx];
        let result = self.sweep(idx, repeats, peak_point);
        if let Err(e) = &result {
            log::warn!("motors_sync: calibration aborted: {}", e);
            self.finalize_run_axes();
        }
        result
    }

    fn sweep(&mut self, idx: usize, repeats: u32, peak_point: f64) -> SyncResult<CalibrationSamples> {
        self.handle_state(idx, SyncState::Start)?;
        let (_, _, center) = self.axes[idx].config.limits();
        let rd = self.axes[idx].config.geometry.rotation_distance;
        let positions = [center - rd, center, center + rd];
        let max_moves = 4 * i64::from(self.axes[idx].config.microsteps);

        let mut y_samples: Vec<f64> = Vec::new();
        let mut max_steps = 0_i64;
        self.axes[idx].move_msteps = 1;

        for repeat in 1..=repeats {
            // Restore the last true magnitude after the lowering pass
            let axis = &mut self.axes[idx];
            axis.new_magnitude = axis.magnitude;
            self.reporter.respond_info(&format!(
                "Repeats: {}/{} Try rise to {:.2} and lower to ~0 magnitude",
                repeat, repeats, peak_point
            ));
            let target = positions[(repeat as usize - 1) % positions.len()];
            let name = self.axes[idx].name().to_string();
            self.host.travel_to(&[(name, target)], self.travel_speed)?;

            let mut do_init = true;
            for dir in [MoveDirection::Forward, MoveDirection::Backward] {
                self.axes[idx].move_dir = dir;
                let mut moves = 0;
                loop {
                    let axis = &self.axes[idx];
                    let (new, current) = (axis.new_magnitude, axis.magnitude);
                    let keep_going = match dir {
                        MoveDirection::Backward => new < current || new > peak_point,
                        _ => new > current && new < peak_point,
                    };
                    if !(keep_going || do_init) || moves >= max_moves {
                        break;
                    }
                    if !(do_init && dir == MoveDirection::Forward) {
                        let highest = y_samples.iter().copied().fold(0.0, f64::max);
                        if new > highest {
                            max_steps += self.axes[idx].move_msteps;
                        }
                        y_samples.push(new);
                    }
                    self.axes[idx].magnitude = new;
                    self.single_move(idx, 1)?;
                    let reading = self.measure(idx)?;
                    self.axes[idx].new_magnitude = reading;
                    self.handle_state(idx, SyncState::Stepped)?;
                    do_init = false;
                    moves += 1;
                }
            }
            // Back onto the previous microstep
            self.axes[idx].move_dir = MoveDirection::Forward;
            self.single_move(idx, 1)?;
        }

        // Return to the initial offset
        let axis = &mut self.axes[idx];
        axis.move_dir = MoveDirection::Forward;
        axis.move_msteps = -axis.actual_msteps;
        self.single_move(idx, 1)?;
        self.finalize_axis(idx)?;

        y_samples.sort_by(f64::total_cmp);
        let x_samples = linspace(0.01, max_steps as f64, y_samples.len());
        log::info!("motors_sync: y_samples: {:?}", y_samples);
        log::info!("motors_sync: x_samples: {:?}", x_samples);

        let axis = &self.axes[idx];
        Ok(CalibrationSamples {
            axis: axis.name().to_string(),
            chip: axis.sensor.chip_name().to_string(),
            microsteps: axis.config.microsteps,
            x: x_samples,
            y: y_samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncMethod;
    use crate::testing::{scripted_axis, MemoryReporter, ScriptedSensor, TestHost};
    use approx::assert_relative_eq;

    #[test]
    fn test_linspace() {
        assert!(linspace(0.01, 5.0, 0).is_empty());
        assert_eq!(linspace(0.01, 5.0, 1), vec![0.01]);
        let xs = linspace(0.01, 4.0, 4);
        assert_relative_eq!(xs[0], 0.01);
        assert_relative_eq!(xs[3], 4.0);
        assert_relative_eq!(xs[1] - xs[0], xs[2] - xs[1], epsilon = 1e-12);
    }

    #[test]
    fn test_repeats_validated() {
        let (axis, _) = scripted_axis("x", ScriptedSensor::new(&[0.0]));
        let mut sync = MotorsSync::from_axes(
            TestHost::default(),
            Box::new(MemoryReporter::default()),
            SyncMethod::Sequential,
            vec![axis],
        );
        let opts = CalibrateOptions {
            repeats: Some(1),
            ..CalibrateOptions::default()
        };
        assert!(matches!(sync.calibrate(&opts), Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn test_sweep_returns_to_start_and_collects_samples() {
        // Sync: initial 100, probe 300 (Backward), correction 400 overshoots.
        // Sweep: start 100, rises 5000, 9000, 20000 past the peak,
        // then falls 9000, 5000, 100, and turns up again at 5000.
        let script = [
            100.0, 300.0, 400.0, 100.0, 5000.0, 9000.0, 20000.0, 9000.0, 5000.0, 100.0, 5000.0,
            4000.0, 8000.0, 12000.0, 20000.0, 12000.0, 8000.0, 4000.0, 150.0, 4000.0,
        ];
        let (axis, handle) = scripted_axis("x", ScriptedSensor::new(&script));
        let reporter = MemoryReporter::default();
        let mut sync = MotorsSync::from_axes(
            TestHost::default(),
            Box::new(reporter.clone()),
            SyncMethod::Sequential,
            vec![axis],
        );
        let opts = CalibrateOptions {
            axis: Some("x".to_string()),
            repeats: Some(2),
            peak_point: Some(15000.0),
        };
        let samples = sync.calibrate(&opts).unwrap();

        assert_eq!(samples.axis, "x");
        assert_eq!(samples.microsteps, 16);
        assert!(!samples.y.is_empty());
        assert_eq!(samples.x.len(), samples.y.len());
        assert!(samples.y.windows(2).all(|w| w[0] <= w[1]));
        assert_relative_eq!(samples.x[0], 0.01);
        assert_eq!(sync.axis("x").unwrap().actual_msteps, 0);
        // One session for the sync run, one for the sweep
        assert_eq!(handle.borrow().starts, 2);
        assert_eq!(handle.borrow().finishes, 2);
        assert!(reporter.contains("Calibration started on x axis with 2 repeats"));
    }
}
