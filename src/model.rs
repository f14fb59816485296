//! Calibrated magnitude models and their inverses.
//!
//! A model maps a microstep offset `x` to the measured magnitude `f(x)`;
//! the controller uses the inverse to predict the correction for a reading.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum StepModel {
    Linear { a: f64, b: f64 },
    Quadratic { a: f64, b: f64, c: f64 },
    Power { a: f64, b: f64 },
    Root { a: f64, b: f64 },
    Hyperbolic { a: f64, b: f64 },
    Exponential { a: f64, b: f64, c: f64 },
    EncAuto { a: f64 },
}

impl StepModel {
    pub const NAMES: [&'static str; 7] = [
        "linear",
        "quadratic",
        "power",
        "root",
        "hyperbolic",
        "exponential",
        "enc_auto",
    ];

    /// Build a model from its configuration name and coefficients
    pub fn from_config(name: &str, coeffs: &[f64]) -> SyncResult<Self> {
        let name = name.to_lowercase();
        let (count, forbidden_a) = match name.as_str() {
            "linear" | "power" => (2, None),
            "quadratic" => (3, None),
            "root" | "hyperbolic" => (2, Some(0.0)),
            "exponential" => (3, Some(0.0)),
            "enc_auto" => (1, Some(-1.0)),
            _ => return Err(SyncError::Config(format!("Invalid model '{}'", name))),
        };
        if coeffs.len() != count {
            return Err(SyncError::Config(format!(
                "Model '{}' requires {} coefficients",
                name, count
            )));
        }
        if forbidden_a == Some(coeffs[0]) {
            return Err(SyncError::Config(format!(
                "Coefficient 'a' cannot be {} for a '{}' model",
                coeffs[0], name
            )));
        }
        let model = match name.as_str() {
            "linear" => StepModel::Linear {
                a: coeffs[0],
                b: coeffs[1],
            },
            "quadratic" => StepModel::Quadratic {
                a: coeffs[0],
                b: coeffs[1],
                c: coeffs[2],
            },
            "power" => StepModel::Power {
                a: coeffs[0],
                b: coeffs[1],
            },
            "root" => StepModel::Root {
                a: coeffs[0],
                b: coeffs[1],
            },
            "hyperbolic" => StepModel::Hyperbolic {
                a: coeffs[0],
                b: coeffs[1],
            },
            "exponential" => StepModel::Exponential {
                a: coeffs[0],
                b: coeffs[1],
                c: coeffs[2],
            },
            _ => StepModel::EncAuto { a: coeffs[0] },
        };
        Ok(model)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepModel::Linear { .. } => "linear",
            StepModel::Quadratic { .. } => "quadratic",
            StepModel::Power { .. } => "power",
            StepModel::Root { .. } => "root",
            StepModel::Hyperbolic { .. } => "hyperbolic",
            StepModel::Exponential { .. } => "exponential",
            StepModel::EncAuto { .. } => "enc_auto",
        }
    }

    pub fn coeffs(&self) -> Vec<f64> {
        match *self {
            StepModel::Linear { a, b }
            | StepModel::Power { a, b }
            | StepModel::Root { a, b }
            | StepModel::Hyperbolic { a, b } => vec![a, b],
            StepModel::Quadratic { a, b, c } | StepModel::Exponential { a, b, c } => {
                vec![a, b, c]
            }
            StepModel::EncAuto { a } => vec![a],
        }
    }

    /// Magnitude expected at an offset of `x` microsteps
    pub fn forward(&self, x: f64) -> f64 {
        match *self {
            StepModel::Linear { a, b } => a * x + b,
            StepModel::Quadratic { a, b, c } => a * x * x + b * x + c,
            StepModel::Power { a, b } => a * x.powf(b),
            StepModel::Root { a, b } => a * x.sqrt() + b,
            StepModel::Hyperbolic { a, b } => a / x + b,
            StepModel::Exponential { a, b, c } => a * (b * x).exp() + c,
            StepModel::EncAuto { a } => x * 1e3 * a,
        }
    }

    /// Microstep offset predicted for magnitude `fx`. May be NaN or infinite.
    pub fn solve(&self, fx: f64) -> f64 {
        match *self {
            StepModel::Linear { a, b } => largest_real_root(&[a, b - fx]),
            StepModel::Quadratic { a, b, c } => largest_real_root(&[a, b, c - fx]),
            StepModel::Power { a, b } => (fx / a).powf(1.0 / b),
            StepModel::Root { a, b } => (fx * fx - 2.0 * b * fx + b * b) / (a * a),
            StepModel::Hyperbolic { a, b } => a / (fx - b),
            StepModel::Exponential { a, b, c } => ((fx - c) / a).ln() / b,
            StepModel::EncAuto { a } => fx / 1e3 / a,
        }
    }
}

/// Largest real root of a polynomial given highest degree first, found from
/// the eigenvalues of its companion matrix. NaN when there is none.
pub fn largest_real_root(coeffs: &[f64]) -> f64 {
    let coeffs: Vec<f64> = coeffs.iter().copied().skip_while(|c| *c == 0.0).collect();
    let degree = coeffs.len().saturating_sub(1);
    if degree == 0 {
        return f64::NAN;
    }

    let lead = coeffs[0];
    let mut companion = DMatrix::<f64>::zeros(degree, degree);
    for (col, c) in coeffs[1..].iter().enumerate() {
        companion[(0, col)] = -c / lead;
    }
    for row in 1..degree {
        companion[(row, row - 1)] = 1.0;
    }

    companion
        .complex_eigenvalues()
        .iter()
        .filter(|z| z.im.abs() <= 1e-9 * z.re.abs().max(1.0))
        .map(|z| z.re)
        .fold(f64::NAN, f64::max)
}
