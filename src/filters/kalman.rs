use serde::{Deserialize, Serialize};

/// Scalar Kalman smoother over an already reduced magnitude series.
///
/// Every call to [`KalmanLiteFilter::process_samples`] starts from `(x0, P0)`,
/// so consecutive measurements never share state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KalmanLiteFilter {
    /// State transition gain
    pub a: f64,
    /// Observation gain
    pub h: f64,
    /// Process noise variance
    pub q: f64,
    /// Observation noise variance
    pub r: f64,
    /// Initial error covariance
    pub p0: f64,
    /// Initial state estimate
    pub x0: f64,
}

#[derive(Clone, Copy, Debug)]
struct KalmanState {
    x: f64,
    p: f64,
}

impl Default for KalmanLiteFilter {
    fn default() -> Self {
        Self::from_coeffs([1.1, 1.0, 1e-1, 1e-2, 0.5, 1.0])
    }
}

impl KalmanLiteFilter {
    /// Coefficients in `A, H, Q, R, P0, x0` order
    pub fn from_coeffs(coeffs: [f64; 6]) -> Self {
        let [a, h, q, r, p0, x0] = coeffs;
        Self { a, h, q, r, p0, x0 }
    }

    fn seed(&self) -> KalmanState {
        KalmanState {
            x: self.x0,
            p: self.p0,
        }
    }

    fn update(&self, state: &mut KalmanState, z: f64) -> f64 {
        // Predict
        let x_pred = self.a * state.x;
        let p_pred = self.a * state.p * self.a + self.q;

        // Update
        let s = self.h * p_pred * self.h + self.r;
        let k = p_pred * self.h / s;
        state.x = x_pred + k * (z - self.h * x_pred);
        state.p = (1.0 - k * self.h) * p_pred;
        state.x
    }

    pub fn process_samples(&self, samples: &[f64]) -> Vec<f64> {
        let mut state = self.seed();
        samples.iter().map(|&z| self.update(&mut state, z)).collect()
    }
}
