//! Reduction of a windowed burst of raw samples to one deviation value.
//!
//! Both sensor variants share the same wait/window contract and report a
//! non-negative magnitude rounded to two decimals.

pub mod rotary;
pub mod vibration;

pub use rotary::RotarySensor;
pub use vibration::VibrationSensor;

use std::ops::Range;

use crate::error::{SyncError, SyncResult};
use crate::host::{Reactor, SampleSource};
use crate::types::{MeasurementWindow, Timestamped};

/// Absolute deadline for the sample wait (s)
pub const SAMPLE_WAIT_TIMEOUT: f64 = 5.0;
/// Reactor pause between buffer checks (s)
pub const SAMPLE_POLL_INTERVAL: f64 = 0.010;
/// Number of extreme samples averaged into the peak
pub const TOP_SAMPLES: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChipKind {
    Accelerometer,
    Encoder,
}

impl ChipKind {
    pub fn label(self) -> &'static str {
        match self {
            ChipKind::Accelerometer => "accelerometer",
            ChipKind::Encoder => "encoder",
        }
    }
}

/// How the corrective move direction is found for an axis
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectionStrategy {
    /// Small forward move and a second measurement
    Probe,
    /// Sign of the last raw deviation
    Sign,
}

pub trait DeviationSensor {
    fn chip_name(&self) -> &str;

    fn kind(&self) -> ChipKind;

    /// Name of the reported quantity, "magnitude" or "deviation"
    fn dim_type(&self) -> &'static str;

    fn direction_strategy(&self) -> DirectionStrategy;

    fn start_measurements(&mut self) -> SyncResult<()>;

    fn finish_measurements(&mut self) -> SyncResult<()>;

    /// Clear buffered samples and the measurement window
    fn flush_data(&mut self);

    fn set_window_start(&mut self, print_time: f64);

    fn set_window_end(&mut self, print_time: f64);

    /// Wait for the window to fill and reduce it to a magnitude >= 0
    fn calc_deviation(&mut self, reactor: &mut dyn Reactor) -> SyncResult<f64>;

    /// Signed deviation of the last reduction
    fn raw_deviation(&self) -> f64;
}

/// Samples collected from one source plus the window bracketing them
pub(crate) struct SampleBuffer<S: Timestamped> {
    source: Box<dyn SampleSource<Sample = S>>,
    samples: Vec<S>,
    window: MeasurementWindow,
}

impl<S: Timestamped> SampleBuffer<S> {
    pub(crate) fn new(source: Box<dyn SampleSource<Sample = S>>) -> Self {
        Self {
            source,
            samples: Vec::new(),
            window: MeasurementWindow::default(),
        }
    }

    pub(crate) fn start(&mut self) -> SyncResult<()> {
        self.flush();
        self.source.start_session()
    }

    pub(crate) fn finish(&mut self) -> SyncResult<()> {
        self.source.finish_session()
    }

    pub(crate) fn flush(&mut self) {
        self.source.clear();
        self.samples.clear();
        self.window.clear();
    }

    pub(crate) fn set_start(&mut self, print_time: f64) {
        self.window.start = Some(print_time);
    }

    pub(crate) fn set_end(&mut self, print_time: f64) {
        self.window.end = Some(print_time);
    }

    /// Poll until a sample at or past the window end has arrived.
    pub(crate) fn wait(&mut self, reactor: &mut dyn Reactor, sensor: &str) -> SyncResult<()> {
        let deadline = reactor.monotonic() + SAMPLE_WAIT_TIMEOUT;
        loop {
            let now = reactor.monotonic();
            reactor.pause(now + SAMPLE_POLL_INTERVAL);
            self.source.drain_into(&mut self.samples);
            if let Some(last) = self.samples.last() {
                if self.window.is_closed_by(last.timestamp()) {
                    return Ok(());
                }
            }
            if now > deadline {
                return Err(SyncError::SensorTimeout {
                    sensor: sensor.to_string(),
                });
            }
        }
    }

    pub(crate) fn selected(&self) -> &[S] {
        self.window.select(&self.samples)
    }
}

/// Settled interior slice of a window used as the baseline
pub fn static_zone(len: usize) -> Range<usize> {
    len / 5..len / 3
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Static zone of a window of `len` samples, or a sensor error when it is
/// empty or reaches past `available` samples.
pub(crate) fn checked_static_zone(len: usize, available: usize) -> SyncResult<Range<usize>> {
    let zone = static_zone(len);
    if zone.is_empty() {
        return Err(SyncError::Sensor(format!(
            "window of {} samples has an empty static zone",
            len
        )));
    }
    if zone.end > available {
        return Err(SyncError::Sensor(format!(
            "only {} of {} samples left after filtering",
            available, len
        )));
    }
    Ok(zone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSample;

    struct SilentSource;

    impl SampleSource for SilentSource {
        type Sample = PositionSample;

        fn start_session(&mut self) -> SyncResult<()> {
            Ok(())
        }

        fn finish_session(&mut self) -> SyncResult<()> {
            Ok(())
        }

        fn clear(&mut self) {}

        fn drain_into(&mut self, _out: &mut Vec<PositionSample>) -> usize {
            0
        }
    }

    struct StepClock {
        now: f64,
        pauses: usize,
    }

    impl Reactor for StepClock {
        fn monotonic(&self) -> f64 {
            self.now
        }

        fn pause(&mut self, until: f64) {
            self.pauses += 1;
            self.now = until;
        }
    }

    #[test]
    fn test_static_zone() {
        assert_eq!(static_zone(10), 2..3);
        assert_eq!(static_zone(600), 120..200);
        assert!(static_zone(4).is_empty());
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(57.004), 57.0);
        assert_eq!(round2(1.236), 1.24);
        assert_eq!(round2(-0.004), 0.0);
    }

    #[test]
    fn test_wait_times_out_without_samples() {
        let mut buffer = SampleBuffer::new(Box::new(SilentSource));
        buffer.set_start(1.0);
        buffer.set_end(2.0);
        let mut clock = StepClock {
            now: 100.0,
            pauses: 0,
        };
        let err = buffer.wait(&mut clock, "encoder").unwrap_err();
        assert_eq!(
            err,
            SyncError::SensorTimeout {
                sensor: "encoder".to_string()
            }
        );
        // 5 s deadline at 10 ms polls
        assert!(clock.pauses > 490 && clock.pauses < 510);
    }

    #[test]
    fn test_checked_zone_rejects_short_window() {
        assert!(checked_static_zone(3, 3).is_err());
        assert!(checked_static_zone(30, 5).is_err());
        assert_eq!(checked_static_zone(30, 30).unwrap(), 6..10);
    }
}
