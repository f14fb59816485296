use super::{
    checked_static_zone, mean, round2, ChipKind, DeviationSensor, DirectionStrategy,
    SampleBuffer, TOP_SAMPLES,
};
use crate::error::SyncResult;
use crate::host::{EncoderChip, Reactor};
use crate::types::PositionSample;

/// Encoder ticks per full revolution
pub const TICKS_PER_REVOLUTION: f64 = 65536.0;
/// Slowest accepted encoder sampling period (s)
pub const MIN_SAMPLE_PERIOD: f64 = 0.000400;

/// Positional deviation (µm) of the main stepper measured by an angle encoder
pub struct RotarySensor {
    chip_name: String,
    buffer: SampleBuffer<PositionSample>,
    rotation_distance: f64,
    raw_deviation: f64,
}

impl RotarySensor {
    pub fn attach(chip_name: &str, chip: EncoderChip, rotation_distance: f64) -> Self {
        Self {
            chip_name: chip_name.to_string(),
            buffer: SampleBuffer::new(chip.source),
            rotation_distance,
            raw_deviation: 0.0,
        }
    }
}

impl DeviationSensor for RotarySensor {
    fn chip_name(&self) -> &str {
        &self.chip_name
    }

    fn kind(&self) -> ChipKind {
        ChipKind::Encoder
    }

    fn dim_type(&self) -> &'static str {
        "deviation"
    }

    fn direction_strategy(&self) -> DirectionStrategy {
        DirectionStrategy::Sign
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
        self.buffer.wait(reactor, ChipKind::Encoder.label())?;
        let positions: Vec<f64> = self.buffer.selected().iter().map(|s| s.position).collect();
        let deviation = position_deviation(&positions, self.rotation_distance)?;
        self.raw_deviation = deviation;
        Ok(deviation.abs())
    }

    fn raw_deviation(&self) -> f64 {
        self.raw_deviation
    }
}

/// Signed deviation in µm of the largest excursions from the static position
pub fn position_deviation(positions: &[f64], rotation_distance: f64) -> SyncResult<f64> {
    let zone = checked_static_zone(positions.len(), positions.len())?;
    let baseline = mean(&positions[zone]);

    let mut deviations: Vec<f64> = positions.iter().map(|p| p - baseline).collect();
    deviations.sort_by(|a, b| b.abs().total_cmp(&a.abs()));
    let ticks = mean(&deviations[..TOP_SAMPLES.min(deviations.len())]);

    Ok(round2(ticks_to_mm(ticks, rotation_distance) * 1e3))
}

pub fn ticks_to_mm(ticks: f64, rotation_distance: f64) -> f64 {
    ticks / TICKS_PER_REVOLUTION * rotation_distance
}
