use super::{
    checked_static_zone, mean, round2, ChipKind, DeviationSensor, DirectionStrategy,
    SampleBuffer, TOP_SAMPLES,
};
use crate::error::{SyncError, SyncResult};
use crate::filters::{ChipFilter, ACCEL_FILTER_THRESHOLD};
use crate::host::{AccelChip, Reactor};
use crate::types::AccelSample;

/// Beacon probes do not report a data rate but always sample above
/// the filter threshold.
const BEACON_CHIP: &str = "beacon";

/// Impact magnitude from an accelerometer mounted on the toolhead
pub struct VibrationSensor {
    chip_name: String,
    buffer: SampleBuffer<AccelSample>,
    filter: ChipFilter,
    last_magnitude: f64,
}

impl VibrationSensor {
    /// Bind an accelerometer chip. The configured filter is only used when
    /// the chip samples faster than [`ACCEL_FILTER_THRESHOLD`].
    pub fn attach(chip_name: &str, chip: AccelChip, filter: &ChipFilter) -> SyncResult<Self> {
        let filter = match chip.data_rate {
            Some(rate) if rate > ACCEL_FILTER_THRESHOLD => filter.clone(),
            Some(_) => ChipFilter::Identity,
            None if chip_name == BEACON_CHIP => filter.clone(),
            None => {
                return Err(SyncError::Config(format!(
                    "Unknown accelerometer '{}' sampling rate",
                    chip_name
                )))
            }
        };
        log::debug!(
            "motors_sync: accelerometer '{}' uses '{}' filter",
            chip_name,
            filter.name()
        );
        Ok(Self {
            chip_name: chip_name.to_string(),
            buffer: SampleBuffer::new(chip.source),
            filter,
            last_magnitude: 0.0,
        })
    }

    pub fn filter(&self) -> &ChipFilter {
        &self.filter
    }
}

impl DeviationSensor for VibrationSensor {
    fn chip_name(&self) -> &str {
        &self.chip_name
    }

    fn kind(&self) -> ChipKind {
        ChipKind::Accelerometer
    }

    fn dim_type(&self) -> &'static str {
        "magnitude"
    }

    fn direction_strategy(&self) -> DirectionStrategy {
        DirectionStrategy::Probe
    }

    fn start_measurements(&mut self) -> SyncResult<()> {
        self.buffer.start()
    }

    fn finish_measurements(&mut self) -> SyncResult<()> {
        self.buffer.finish()
    }

    fn flush_data(&mut self) {
        self.buffer.flush();
    }

    fn set_window_start(&mut self, print_time: f64) {
        self.buffer.set_start(print_time);
    }

    fn set_window_end(&mut self, print_time: f64) {
        self.buffer.set_end(print_time);
    }

    fn calc_deviation(&mut self, reactor: &mut dyn Reactor) -> SyncResult<f64> {
        self.buffer.wait(reactor, ChipKind::Accelerometer.label())?;
        let magnitude = impact_magnitude(self.buffer.selected(), &self.filter)?;
        self.last_magnitude = magnitude;
        Ok(magnitude)
    }

    fn raw_deviation(&self) -> f64 {
        self.last_magnitude
    }
}

/// Reduce a window of accelerometer samples to the impact magnitude.
///
/// The axis carrying gravity over the static zone is dropped and the
/// remaining two are combined into a per-sample norm.
pub fn impact_magnitude(samples: &[AccelSample], filter: &ChipFilter) -> SyncResult<f64> {
    let zone = checked_static_zone(samples.len(), samples.len())?;
    let zone_len = zone.len() as f64;

    let mut abs_means = [0.0_f64; 3];
    for sample in &samples[zone] {
        for (acc, value) in abs_means.iter_mut().zip(sample.axes()) {
            *acc += value.abs() / zone_len;
        }
    }
    let gravity_axis = abs_means
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx)
        .unwrap_or(2);

    let norms: Vec<f64> = samples
        .iter()
        .map(|sample| {
            sample
                .axes()
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != gravity_axis)
                .map(|(_, v)| v * v)
                .sum::<f64>()
                .sqrt()
        })
        .collect();

    magnitude_from_series(&norms, filter)
}

/// Peak-over-baseline of a scalar series after filtering
pub fn magnitude_from_series(series: &[f64], filter: &ChipFilter) -> SyncResult<f64> {
    let filtered = filter.apply(series);
    let zone = checked_static_zone(series.len(), filtered.len())?;
    let baseline = mean(&filtered[zone]);

    let mut sorted = filtered;
    sorted.sort_by(|a, b| b.total_cmp(a));
    let peak = mean(&sorted[..TOP_SAMPLES.min(sorted.len())]);

    Ok(round2(peak - baseline).max(0.0))
}
