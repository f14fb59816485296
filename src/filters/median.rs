use crate::error::{SyncError, SyncResult};

/// Sliding median over a fixed odd window, edges dropped
#[derive(Clone, Debug, PartialEq)]
pub struct MedianFilter {
    window_size: usize,
}

impl MedianFilter {
    pub const MIN_WINDOW: usize = 3;
    pub const MAX_WINDOW: usize = 9;

    /// Create a median filter; the window must be odd and within 3..=9
    pub fn new(window_size: usize) -> SyncResult<Self> {
        if window_size % 2 == 0 {
            return Err(SyncError::Config(format!(
                "parameter 'median_size' cannot be even, got {}",
                window_size
            )));
        }
        if !(Self::MIN_WINDOW..=Self::MAX_WINDOW).contains(&window_size) {
            return Err(SyncError::Config(format!(
                "parameter 'median_size' must be within {}..={}, got {}",
                Self::MIN_WINDOW,
                Self::MAX_WINDOW,
                window_size
            )));
        }
        Ok(Self { window_size })
    }

    /// Number of samples dropped on each edge
    pub fn half_width(&self) -> usize {
        self.window_size / 2
    }

    /// Output has `len - 2 * (w / 2)` samples; shorter inputs give nothing
    pub fn apply(&self, samples: &[f64]) -> Vec<f64> {
        let mid = self.half_width();
        let mut scratch = Vec::with_capacity(self.window_size);
        samples
            .windows(self.window_size)
            .map(|window| {
                scratch.clear();
                scratch.extend_from_slice(window);
                scratch.sort_by(f64::total_cmp);
                scratch[mid]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_even_window() {
        assert!(matches!(MedianFilter::new(4), Err(SyncError::Config(_))));
        assert!(matches!(MedianFilter::new(1), Err(SyncError::Config(_))));
        assert!(MedianFilter::new(11).is_err());
        assert!(MedianFilter::new(5).is_ok());
    }

    #[test]
    fn test_output_length() {
        for window in [3, 5, 7, 9] {
            let filter = MedianFilter::new(window).unwrap();
            for len in [window + 1, 20, 57] {
                let samples: Vec<f64> = (0..len).map(|i| i as f64).collect();
                let out = filter.apply(&samples);
                assert_eq!(out.len(), len - 2 * (window / 2));
            }
        }
    }

    #[test]
    fn test_removes_spike() {
        let filter = MedianFilter::new(3).unwrap();
        let out = filter.apply(&[1.0, 1.0, 50.0, 1.0, 1.0]);
        assert_eq!(out, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_short_input_is_empty() {
        let filter = MedianFilter::new(5).unwrap();
        assert!(filter.apply(&[1.0, 2.0, 3.0]).is_empty());
    }
}
