/// Denoising filters applied to a reduced magnitude series before
/// feature extraction.
pub mod kalman;
pub mod median;

pub use kalman::KalmanLiteFilter;
pub use median::MedianFilter;

/// Accelerometers sampling at or below this rate (Hz) are not filtered
pub const ACCEL_FILTER_THRESHOLD: f64 = 3000.0;

#[derive(Clone, Debug, PartialEq)]
pub enum ChipFilter {
    Identity,
    Median(MedianFilter),
    Kalman(KalmanLiteFilter),
}

impl ChipFilter {
    pub fn apply(&self, samples: &[f64]) -> Vec<f64> {
        match self {
            ChipFilter::Identity => samples.to_vec(),
            ChipFilter::Median(filter) => filter.apply(samples),
            ChipFilter::Kalman(filter) => filter.process_samples(samples),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChipFilter::Identity => "none",
            ChipFilter::Median(_) => "median",
            ChipFilter::Kalman(_) => "kalman",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_returns_input() {
        let samples = vec![3.0, -1.5, 8.25, 0.0];
        assert_eq!(ChipFilter::Identity.apply(&samples), samples);
    }

    #[test]
    fn test_dispatch() {
        let median = ChipFilter::Median(MedianFilter::new(3).unwrap());
        assert_eq!(median.apply(&[1.0, 9.0, 1.0, 1.0]).len(), 2);
        let kalman = ChipFilter::Kalman(KalmanLiteFilter::default());
        assert_eq!(kalman.apply(&[1.0, 9.0, 1.0, 1.0]).len(), 4);
        assert_eq!(kalman.name(), "kalman");
    }
}
