use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::filters::{ChipFilter, KalmanLiteFilter, MedianFilter};
use crate::model::StepModel;

// ===== Raw configuration document =====

/// Options accepted both in `defaults` and per axis. Per axis values win.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AxisOptions {
    pub microsteps: Option<u32>,
    pub model: Option<String>,
    pub model_coeffs: Option<Vec<f64>>,
    pub max_step_size: Option<u32>,
    pub axes_steps_diff: Option<u32>,
    pub retry_tolerance: Option<f64>,
    pub retries: Option<u32>,
    pub chip_filter: Option<String>,
    pub median_size: Option<usize>,
    pub kalman_coeffs: Option<Vec<f64>>,
    pub accel_chip: Option<String>,
    pub encoder_chip: Option<String>,
    pub head_fan: Option<String>,
    pub buzz: Option<bool>,
}

impl AxisOptions {
    /// Per-axis options with unset fields taken from `defaults`
    fn merged(&self, defaults: &AxisOptions) -> AxisOptions {
        AxisOptions {
            // A per-axis 0 inherits the global value
            microsteps: self
                .microsteps
                .filter(|m| *m != 0)
                .or(defaults.microsteps),
            model: self.model.clone().or_else(|| defaults.model.clone()),
            model_coeffs: self
                .model_coeffs
                .clone()
                .or_else(|| defaults.model_coeffs.clone()),
            max_step_size: self.max_step_size.or(defaults.max_step_size),
            axes_steps_diff: self.axes_steps_diff.or(defaults.axes_steps_diff),
            retry_tolerance: self.retry_tolerance.or(defaults.retry_tolerance),
            retries: self.retries.or(defaults.retries),
            chip_filter: self
                .chip_filter
                .clone()
                .or_else(|| defaults.chip_filter.clone()),
            median_size: self.median_size.or(defaults.median_size),
            kalman_coeffs: self
                .kalman_coeffs
                .clone()
                .or_else(|| defaults.kalman_coeffs.clone()),
            accel_chip: self
                .accel_chip
                .clone()
                .or_else(|| defaults.accel_chip.clone()),
            encoder_chip: self.encoder_chip.clone(),
            head_fan: self.head_fan.clone().or_else(|| defaults.head_fan.clone()),
            buzz: self.buzz.or(defaults.buzz),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StepperSection {
    pub rotation_distance: f64,
    #[serde(default = "default_full_steps")]
    pub full_steps_per_rotation: u32,
    #[serde(default)]
    pub position_min: f64,
    pub position_max: f64,
}

fn default_full_steps() -> u32 {
    200
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AxisSection {
    pub stepper: StepperSection,
    #[serde(flatten)]
    pub options: AxisOptions,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncConfig {
    pub kinematics: String,
    #[serde(default)]
    pub axes: Vec<String>,
    #[serde(default = "default_sync_method")]
    pub sync_method: String,
    #[serde(default)]
    pub defaults: AxisOptions,
    #[serde(default)]
    pub axis: BTreeMap<String, AxisSection>,
}

fn default_sync_method() -> String {
    "default".to_string()
}

// ===== Validated plan =====

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kinematics {
    Cartesian,
    CoreXY,
    LimitedCoreXY,
}

impl Kinematics {
    fn parse(name: &str) -> SyncResult<Self> {
        match name {
            "cartesian" => Ok(Kinematics::Cartesian),
            "corexy" => Ok(Kinematics::CoreXY),
            "limited_corexy" => Ok(Kinematics::LimitedCoreXY),
            other => Err(SyncError::Config(format!(
                "Not supported kinematics '{}'",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kinematics::Cartesian => "cartesian",
            Kinematics::CoreXY => "corexy",
            Kinematics::LimitedCoreXY => "limited_corexy",
        }
    }

    /// Axes share belts, so exercising one disturbs the other
    pub fn is_coupled(self) -> bool {
        !matches!(self, Kinematics::Cartesian)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMethod {
    Sequential,
    Alternately,
    Synchronous,
}

impl SyncMethod {
    fn parse(name: &str, kinematics: Kinematics) -> SyncResult<Self> {
        let method = match name {
            "default" if kinematics.is_coupled() => SyncMethod::Alternately,
            "default" | "sequential" => SyncMethod::Sequential,
            "alternately" => SyncMethod::Alternately,
            "synchronous" => SyncMethod::Synchronous,
            other => {
                return Err(SyncError::Config(format!(
                    "Invalid sync method '{}'",
                    other
                )))
            }
        };
        if method != SyncMethod::Sequential && !kinematics.is_coupled() {
            return Err(SyncError::Config(format!(
                "Invalid sync method: {} for '{}' type kinematics",
                method.name(),
                kinematics.name()
            )));
        }
        Ok(method)
    }

    pub fn name(self) -> &'static str {
        match self {
            SyncMethod::Sequential => "sequential",
            SyncMethod::Alternately => "alternately",
            SyncMethod::Synchronous => "synchronous",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepperGeometry {
    pub rotation_distance: f64,
    pub full_steps_per_rotation: u32,
    pub position_min: f64,
    pub position_max: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SensorPlan {
    Accelerometer { chip: String },
    Encoder { chip: String },
}


/// Fully validated calibration of one axis
#[derive(Clone, Debug, PartialEq)]
pub struct AxisPlan {
    pub name: String,
    pub joint_axes: Vec<String>,
    pub geometry: StepperGeometry,
    pub microsteps: u32,
    pub model: StepModel,
    pub max_step_size: u32,
    pub axes_steps_diff: u32,
    /// 0 when no tolerance is configured
    pub retry_tolerance: f64,
    pub max_retries: u32,
    pub sensor: SensorPlan,
    pub filter: ChipFilter,
    pub head_fan: Option<String>,
    pub buzz: bool,
}

impl AxisPlan {
    /// Linear distance of one microstep (mm)
    pub fn move_d(&self) -> f64 {
        self.geometry.rotation_distance
            / f64::from(self.geometry.full_steps_per_rotation)
            / f64::from(self.microsteps)
    }

    /// (min + 10, max - 10, center)
    pub fn limits(&self) -> (f64, f64, f64) {
        let g = &self.geometry;
        (
            g.position_min + 10.0,
            g.position_max - 10.0,
            (g.position_min + g.position_max) / 2.0,
        )
    }

    /// Amplitude of the buzz oscillation (mm)
    pub fn rel_buzz_d(&self) -> f64 {
        self.geometry.rotation_distance / f64::from(self.geometry.full_steps_per_rotation) * 5.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncPlan {
    pub kinematics: Kinematics,
    pub sync_method: SyncMethod,
    pub axes: Vec<AxisPlan>,
}

impl SyncPlan {
    pub fn axis(&self, name: &str) -> Option<&AxisPlan> {
        self.axes.iter().find(|a| a.name == name)
    }
}

// ===== Validation =====

pub const VALID_MICROSTEPS: [u32; 6] = [8, 16, 32, 64, 128, 256];
pub const VALID_AXES: [&str; 2] = ["x", "y"];
pub const DEFAULT_MICROSTEPS: u32 = 16;
pub const DEFAULT_MAX_STEP_SIZE: u32 = 3;
pub const MAX_RETRIES: u32 = 10;

fn config_err(msg: impl Into<String>) -> SyncError {
    SyncError::Config(msg.into())
}

impl SyncConfig {
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| config_err(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text).map_err(|e| config_err(format!("invalid config: {}", e)))
    }

    /// Validate the document and build the plan. No hardware is touched.
    pub fn configure(&self) -> SyncResult<SyncPlan> {
        let kinematics = Kinematics::parse(&self.kinematics.to_lowercase())?;
        let mut axes: Vec<String> = self.axes.iter().map(|a| a.to_lowercase()).collect();
        if kinematics.is_coupled() {
            if axes.is_empty() {
                axes = VALID_AXES.iter().map(|a| a.to_string()).collect();
            }
            if axes.len() != 2 {
                return Err(config_err(format!(
                    "'{}' kinematics requires exactly 2 axes, got {}",
                    kinematics.name(),
                    axes.len()
                )));
            }
        } else if axes.is_empty() {
            return Err(config_err("parameter 'axes' must be provided"));
        }
        let mut seen = Vec::new();
        for axis in &axes {
            if !VALID_AXES.contains(&axis.as_str()) || seen.contains(&axis) {
                return Err(config_err(format!(
                    "Invalid axes parameter '{}'",
                    axes.join(",")
                )));
            }
            seen.push(axis);
        }

        let sync_method = SyncMethod::parse(&self.sync_method.to_lowercase(), kinematics)?;
        if sync_method != SyncMethod::Sequential && axes.len() > 2 {
            return Err(config_err(format!(
                "sync method '{}' supports at most 2 axes",
                sync_method.name()
            )));
        }
        if self.defaults.encoder_chip.is_some() {
            return Err(config_err("'encoder_chip' can only be set per axis"));
        }

        let mut plans = Vec::with_capacity(axes.len());
        for name in &axes {
            let joint_axes = if kinematics.is_coupled() {
                axes.iter().filter(|a| *a != name).cloned().collect()
            } else {
                Vec::new()
            };
            plans.push(self.axis_plan(name, joint_axes)?);
        }
        if kinematics.is_coupled() {
            check_common_options(&plans, kinematics)?;
        }

        Ok(SyncPlan {
            kinematics,
            sync_method,
            axes: plans,
        })
    }

    fn axis_plan(&self, name: &str, joint_axes: Vec<String>) -> SyncResult<AxisPlan> {
        let section = self
            .axis
            .get(name)
            .ok_or_else(|| config_err(format!("missing section for axis '{}'", name)))?;
        let st = &section.stepper;
        if st.rotation_distance <= 0.0 {
            return Err(config_err(format!(
                "'rotation_distance' of axis '{}' must be above 0",
                name
            )));
        }
        if st.full_steps_per_rotation == 0 {
            return Err(config_err(format!(
                "'full_steps_per_rotation' of axis '{}' must be above 0",
                name
            )));
        }
        if st.position_max <= st.position_min {
            return Err(config_err(format!(
                "'position_max' of axis '{}' must be above 'position_min'",
                name
            )));
        }
        let geometry = StepperGeometry {
            rotation_distance: st.rotation_distance,
            full_steps_per_rotation: st.full_steps_per_rotation,
            position_min: st.position_min,
            position_max: st.position_max,
        };

        if section.options.accel_chip.is_some() && section.options.encoder_chip.is_some() {
            return Err(config_err("Only 1 sensor type can be selected"));
        }
        let opts = section.options.merged(&self.defaults);

        let microsteps = match opts.microsteps.filter(|m| *m != 0) {
            None => DEFAULT_MICROSTEPS,
            Some(m) if VALID_MICROSTEPS.contains(&m) => m,
            Some(m) => {
                return Err(config_err(format!(
                    "Invalid microsteps '{}', must be one of {:?}",
                    m, VALID_MICROSTEPS
                )))
            }
        };
        let move_d = st.rotation_distance / f64::from(st.full_steps_per_rotation) / f64::from(microsteps);

        let max_step_limit = microsteps / 2;
        let max_step_size = opts.max_step_size.unwrap_or(DEFAULT_MAX_STEP_SIZE);
        if !(1..=max_step_limit).contains(&max_step_size) {
            return Err(config_err(format!(
                "'max_step_size' must be within 1..={}, got {}",
                max_step_limit, max_step_size
            )));
        }
        let axes_steps_diff = opts.axes_steps_diff.unwrap_or(max_step_size + 1);
        if axes_steps_diff < 1 {
            return Err(config_err("'axes_steps_diff' must be at least 1"));
        }

        let retry_tolerance = opts.retry_tolerance.unwrap_or(0.0);
        let min_tolerance = move_d * 1e3;
        if retry_tolerance != 0.0 && retry_tolerance <= min_tolerance {
            return Err(config_err(format!(
                "'retry_tolerance' must be above {}, got {}",
                min_tolerance, retry_tolerance
            )));
        }
        let max_retries = opts.retries.unwrap_or(0);
        if max_retries > MAX_RETRIES {
            return Err(config_err(format!(
                "'retries' must be within 0..={}, got {}",
                MAX_RETRIES, max_retries
            )));
        }

        let sensor = match (&opts.encoder_chip, &opts.accel_chip) {
            (Some(chip), _) => SensorPlan::Encoder { chip: chip.clone() },
            (None, Some(chip)) => SensorPlan::Accelerometer {
                chip: chip.to_lowercase(),
            },
            (None, None) => {
                return Err(config_err(
                    "Sensors type 'accel_chip' or 'encoder_chip' must be provided",
                ))
            }
        };

        let filter = chip_filter(&opts)?;

        let (default_model, default_coeffs) = match sensor {
            SensorPlan::Accelerometer { .. } => ("linear", vec![20000.0, 0.0]),
            SensorPlan::Encoder { .. } => ("enc_auto", vec![move_d]),
        };
        let model_name = opts.model.clone().unwrap_or_else(|| default_model.to_string());
        let coeffs = opts.model_coeffs.clone().unwrap_or(default_coeffs);
        let model = StepModel::from_config(&model_name, &coeffs)?;

        Ok(AxisPlan {
            name: name.to_string(),
            joint_axes,
            geometry,
            microsteps,
            model,
            max_step_size,
            axes_steps_diff,
            retry_tolerance,
            max_retries,
            sensor,
            filter,
            head_fan: opts.head_fan.clone(),
            buzz: opts.buzz.unwrap_or(true),
        })
    }
}

fn chip_filter(opts: &AxisOptions) -> SyncResult<ChipFilter> {
    let name = opts
        .chip_filter
        .as_deref()
        .unwrap_or("median")
        .to_lowercase();
    match name.as_str() {
        "median" | "default" => {
            let window = opts.median_size.unwrap_or(MedianFilter::MIN_WINDOW);
            MedianFilter::new(window).map(ChipFilter::Median)
        }
        "kalman" => match &opts.kalman_coeffs {
            None => Ok(ChipFilter::Kalman(KalmanLiteFilter::default())),
            Some(coeffs) => {
                let coeffs: [f64; 6] = coeffs.as_slice().try_into().map_err(|_| {
                    config_err(format!(
                        "'kalman_coeffs' requires 6 values, got {}",
                        coeffs.len()
                    ))
                })?;
                Ok(ChipFilter::Kalman(KalmanLiteFilter::from_coeffs(coeffs)))
            }
        },
        "none" => Ok(ChipFilter::Identity),
        other => Err(config_err(format!("Invalid chip filter '{}'", other))),
    }
}

/// Coupled axes must share the options the leveling math compares
fn check_common_options(plans: &[AxisPlan], kinematics: Kinematics) -> SyncResult<()> {
    let checks: [(&str, fn(&AxisPlan) -> String); 5] = [
        ("microsteps", |p| p.microsteps.to_string()),
        ("model", |p| p.model.name().to_string()),
        ("model_coeffs", |p| format!("{:?}", p.model.coeffs())),
        ("max_step_size", |p| p.max_step_size.to_string()),
        ("axes_steps_diff", |p| p.axes_steps_diff.to_string()),
    ];
    for (option, value) in checks {
        let mut values: Vec<String> = plans.iter().map(value).collect();
        values.dedup();
        if values.len() > 1 {
            let listed: Vec<String> = values.iter().map(|v| format!("'{}: {}'", option, v)).collect();
            return Err(config_err(format!(
                "Options {} cannot be different for a '{}' kinematics",
                listed.join(", "),
                kinematics.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COREXY: &str = r#"{
        "kinematics": "corexy",
        "defaults": { "accel_chip": "adxl345" },
        "axis": {
            "x": { "stepper": { "rotation_distance": 40, "position_max": 300 } },
            "y": { "stepper": { "rotation_distance": 40, "position_max": 300 }, "retry_tolerance": 2000 }
        }
    }"#;

    fn corexy_with(patch: impl FnOnce(&mut SyncConfig)) -> SyncResult<SyncPlan> {
        let mut config = SyncConfig::from_json(COREXY).unwrap();
        patch(&mut config);
        config.configure()
    }

    #[test]
    fn test_corexy_defaults() {
        let plan = corexy_with(|_| {}).unwrap();
        assert_eq!(plan.kinematics, Kinematics::CoreXY);
        assert_eq!(plan.sync_method, SyncMethod::Alternately);
        let x = plan.axis("x").unwrap();
        assert_eq!(x.microsteps, 16);
        assert_eq!(x.max_step_size, 3);
        assert_eq!(x.axes_steps_diff, 4);
        assert_eq!(x.joint_axes, vec!["y".to_string()]);
        assert_eq!(x.model, StepModel::Linear { a: 20000.0, b: 0.0 });
        assert_eq!(x.filter, ChipFilter::Median(MedianFilter::new(3).unwrap()));
        assert_eq!(x.retry_tolerance, 0.0);
        assert_eq!(x.limits(), (10.0, 290.0, 150.0));
        assert!((x.move_d() - 0.0125).abs() < 1e-12);
        assert!((x.rel_buzz_d() - 1.0).abs() < 1e-12);
        assert_eq!(plan.axis("y").unwrap().retry_tolerance, 2000.0);
    }

    #[test]
    fn test_encoder_default_model() {
        let plan = corexy_with(|c| {
            for (name, section) in c.axis.iter_mut() {
                section.options.encoder_chip = Some(format!("encoder_{}", name));
            }
            c.defaults.accel_chip = None;
        })
        .unwrap();
        let x = plan.axis("x").unwrap();
        assert_eq!(
            x.sensor,
            SensorPlan::Encoder {
                chip: "encoder_x".to_string()
            }
        );
        assert_eq!(x.model, StepModel::EncAuto { a: 0.0125 });
    }

    #[test]
    fn test_both_sensors_rejected() {
        let err = corexy_with(|c| {
            let x = c.axis.get_mut("x").unwrap();
            x.options.accel_chip = Some("adxl345".to_string());
            x.options.encoder_chip = Some("encoder_x".to_string());
        })
        .unwrap_err();
        assert_eq!(err, config_err("Only 1 sensor type can be selected"));
    }

    #[test]
    fn test_missing_sensor_rejected() {
        assert!(corexy_with(|c| c.defaults.accel_chip = None).is_err());
    }

    #[test]
    fn test_range_checks() {
        assert!(corexy_with(|c| c.defaults.max_step_size = Some(9)).is_err());
        assert!(corexy_with(|c| c.defaults.max_step_size = Some(0)).is_err());
        assert!(corexy_with(|c| c.defaults.retries = Some(11)).is_err());
        assert!(corexy_with(|c| c.defaults.median_size = Some(4)).is_err());
        assert!(corexy_with(|c| c.defaults.microsteps = Some(12)).is_err());
        assert!(corexy_with(|c| c.defaults.kalman_coeffs = Some(vec![1.0; 5])).is_ok());
        assert!(corexy_with(|c| {
            c.defaults.chip_filter = Some("kalman".to_string());
            c.defaults.kalman_coeffs = Some(vec![1.0; 5]);
        })
        .is_err());
        // move_d * 1000 = 12.5
        assert!(corexy_with(|c| c.defaults.retry_tolerance = Some(12.5)).is_err());
        assert!(corexy_with(|c| c.defaults.retry_tolerance = Some(13.0)).is_ok());
    }

    #[test]
    fn test_coupled_axes_must_match() {
        let err = corexy_with(|c| {
            c.axis.get_mut("y").unwrap().options.max_step_size = Some(2);
        })
        .unwrap_err();
        match err {
            SyncError::Config(msg) => assert!(msg.contains("max_step_size"), "{}", msg),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_cartesian_rules() {
        let text = r#"{
            "kinematics": "cartesian",
            "axes": ["x"],
            "defaults": { "accel_chip": "adxl345" },
            "axis": { "x": { "stepper": { "rotation_distance": 40, "position_max": 200 } } }
        }"#;
        let mut config = SyncConfig::from_json(text).unwrap();
        let plan = config.configure().unwrap();
        assert_eq!(plan.sync_method, SyncMethod::Sequential);
        assert!(plan.axes[0].joint_axes.is_empty());

        config.sync_method = "alternately".to_string();
        assert!(config.configure().is_err());

        config.sync_method = "sequential".to_string();
        config.axes = vec!["z".to_string()];
        assert!(config.configure().is_err());
    }

    #[test]
    fn test_unknown_kinematics() {
        assert!(corexy_with(|c| c.kinematics = "delta".to_string()).is_err());
    }

    #[test]
    fn test_per_axis_zero_microsteps_inherits() {
        let plan = corexy_with(|c| {
            c.defaults.microsteps = Some(32);
            c.axis.get_mut("x").unwrap().options.microsteps = Some(0);
        })
        .unwrap();
        assert_eq!(plan.axis("x").unwrap().microsteps, 32);
    }
}
