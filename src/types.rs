use serde::{Deserialize, Serialize};

/// Anything delivered by a sensor session with an MCU timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> f64;
}

/// Three-axis accelerometer sample
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelSample {
    pub fn new(timestamp: f64, x: f64, y: f64, z: f64) -> Self {
        Self { timestamp, x, y, z }
    }

    pub fn axes(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

impl Timestamped for AccelSample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

/// Rotary encoder sample, position in raw ticks (65536 per revolution)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub timestamp: f64,
    pub position: f64,
}

impl PositionSample {
    pub fn new(timestamp: f64, position: f64) -> Self {
        Self {
            timestamp,
            position,
        }
    }
}

impl Timestamped for PositionSample {
    fn timestamp(&self) -> f64 {
        self.timestamp
    }
}

/// Direction of the corrective move on the second stepper.
///
/// `Unknown` still moves forward; it only marks that the direction has to be
/// detected before the next prediction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveDirection {
    Unknown,
    Forward,
    Backward,
}

impl MoveDirection {
    pub fn sign(self) -> i64 {
        match self {
            MoveDirection::Backward => -1,
            MoveDirection::Forward | MoveDirection::Unknown => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MoveDirection::Unknown => "unknown",
            MoveDirection::Forward => "Forward",
            MoveDirection::Backward => "Backward",
        }
    }

    pub fn is_unknown(self) -> bool {
        self == MoveDirection::Unknown
    }
}

/// Start and end print times bracketing one excitation.
///
/// Samples are selected on the half-open interval `[start, end)`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeasurementWindow {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl MeasurementWindow {
    pub fn clear(&mut self) {
        self.start = None;
        self.end = None;
    }

    /// True once a sample at or past the end of the window has arrived.
    pub fn is_closed_by(&self, last_timestamp: f64) -> bool {
        self.end.map_or(false, |end| last_timestamp >= end)
    }

    /// Slice of `samples` (sorted by arrival) inside the window.
    pub fn select<'a, S: Timestamped>(&self, samples: &'a [S]) -> &'a [S] {
        let start_idx = match self.start {
            Some(start) => samples.partition_point(|s| s.timestamp() < start),
            None => 0,
        };
        let end_idx = match self.end {
            Some(end) => samples.partition_point(|s| s.timestamp() < end),
            None => samples.len(),
        };
        if start_idx >= end_idx {
            return &[];
        }
        &samples[start_idx..end_idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(timestamps: &[f64]) -> Vec<PositionSample> {
        timestamps
            .iter()
            .map(|&t| PositionSample::new(t, t * 10.0))
            .collect()
    }

    #[test]
    fn test_window_is_half_open() {
        let samples = positions(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let window = MeasurementWindow {
            start: Some(1.0),
            end: Some(3.0),
        };
        let selected = window.select(&samples);
        let stamps: Vec<f64> = selected.iter().map(|s| s.timestamp).collect();
        // Start sample included, end sample excluded
        assert_eq!(stamps, vec![1.0, 2.0]);
    }

    #[test]
    fn test_window_between_samples() {
        let samples = positions(&[0.0, 1.0, 2.0, 3.0]);
        let window = MeasurementWindow {
            start: Some(0.5),
            end: Some(2.5),
        };
        assert_eq!(window.select(&samples).len(), 2);
    }

    #[test]
    fn test_window_closed_by() {
        let window = MeasurementWindow {
            start: Some(1.0),
            end: Some(2.0),
        };
        assert!(!window.is_closed_by(1.9));
        assert!(window.is_closed_by(2.0));
        assert!(!MeasurementWindow::default().is_closed_by(100.0));
    }

    #[test]
    fn test_direction_sign() {
        assert_eq!(MoveDirection::Unknown.sign(), 1);
        assert_eq!(MoveDirection::Forward.sign(), 1);
        assert_eq!(MoveDirection::Backward.sign(), -1);
        assert_eq!(MoveDirection::Backward.label(), "Backward");
    }
}
