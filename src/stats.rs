use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::axis::AxisState;
use crate::error::{SyncError, SyncResult};

pub const STATS_FORMAT: &str = "axis,status,magnitudes,steps,msteps,retries,date";

#[derive(Serialize, Deserialize, Debug)]
struct StatsHeader {
    format: String,
}

/// One synchronized (or failed) axis
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatsRecord {
    pub axis: String,
    pub status: bool,
    pub magnitudes: Vec<i64>,
    pub steps: Vec<i64>,
    pub msteps: u32,
    pub retries: u32,
    pub date: String,
}

impl StatsRecord {
    /// Record of an axis run; axes that never moved are not recorded
    pub fn from_axis(axis: &AxisState, success: bool) -> Option<Self> {
        if axis.actual_msteps == 0 || axis.log.is_empty() {
            return None;
        }
        let (magnitudes, steps) = axis.log.iter().copied().unzip();
        Some(Self {
            axis: axis.name().to_string(),
            status: success,
            magnitudes,
            steps,
            msteps: axis.config.microsteps,
            retries: axis.curr_retry,
            date: chrono::Local::now().format("%Y-%m-%d").to_string(),
        })
    }

    /// Last accepted entry; the final measurement is the reverted overshoot
    fn settled_index(&self) -> usize {
        self.magnitudes.len().saturating_sub(2)
    }
}

/// Append-only JSON-lines statistics log
pub struct StatsStore {
    path: PathBuf,
    error: Option<String>,
}

impl StatsStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let mut store = Self {
            path: path.as_ref().to_path_buf(),
            error: None,
        };
        store.check_log();
        store
    }

    fn check_log(&mut self) {
        if self.path.exists() {
            match self.read_header() {
                Ok(format) if format == STATS_FORMAT => {}
                _ => {
                    self.error = Some(
                        "Invalid format, run 'stats --clear' to reset and fix statistics"
                            .to_string(),
                    );
                }
            }
        } else if let Err(e) = self.write_header() {
            self.error = Some(e.to_string());
        }
        if let Some(err) = &self.error {
            log::warn!("motors_sync: statistics disabled: {}", err);
        }
    }

    fn read_header(&self) -> SyncResult<String> {
        let file = fs::File::open(&self.path)?;
        let mut first = String::new();
        BufReader::new(file).read_line(&mut first)?;
        let header: StatsHeader = serde_json::from_str(first.trim())?;
        Ok(header.format)
    }

    fn write_header(&self) -> SyncResult<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let header = StatsHeader {
            format: STATS_FORMAT.to_string(),
        };
        fs::write(&self.path, serde_json::to_string(&header)? + "\n")?;
        Ok(())
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Append a record; silently skipped while collection is disabled
    pub fn append(&self, record: &StatsRecord) -> SyncResult<()> {
        if self.error.is_some() {
            return Ok(());
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    pub fn read(&self) -> SyncResult<Vec<StatsRecord>> {
        if let Some(err) = &self.error {
            return Err(SyncError::Storage(err.clone()));
        }
        let file = fs::File::open(&self.path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines().skip(1) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Remove the log and start a fresh one
    pub fn clear(&mut self) -> SyncResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        self.error = None;
        self.write_header()
    }

    /// Human readable report, one entry per message
    pub fn report(&self, microsteps_of: impl Fn(&str) -> Option<u32>) -> Vec<String> {
        if let Some(err) = &self.error {
            return vec![format!("Statistics collection is disabled due:\n{}", err)];
        }
        let records = match self.read() {
            Ok(records) => records,
            Err(e) => return vec![format!("Cannot read statistics: {}", e)],
        };
        if records.is_empty() {
            return vec!["Logs are empty".to_string()];
        }
        summarize(&records)
            .iter()
            .map(|stats| {
                let microsteps = microsteps_of(&stats.axis).unwrap_or(16);
                stats.render(microsteps)
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AxisStats {
    pub axis: String,
    pub count: u32,
    pub success: u32,
    pub start_sum: f64,
    pub end_sum: f64,
    /// Sum of |settled offset| normalized to 1/16 microsteps
    pub msteps_sum: f64,
    pub retries_sum: u32,
    pub min_magnitude: f64,
    pub max_magnitude: f64,
}

impl AxisStats {
    fn new(axis: &str) -> Self {
        Self {
            axis: axis.to_string(),
            count: 0,
            success: 0,
            start_sum: 0.0,
            end_sum: 0.0,
            msteps_sum: 0.0,
            retries_sum: 0,
            min_magnitude: f64::INFINITY,
            max_magnitude: f64::NEG_INFINITY,
        }
    }

    fn add(&mut self, record: &StatsRecord) {
        self.count += 1;
        if record.status {
            self.success += 1;
        }
        let settled = record.settled_index();
        self.start_sum += record.magnitudes.first().copied().unwrap_or(0) as f64;
        self.end_sum += record.magnitudes.get(settled).copied().unwrap_or(0) as f64;
        for &m in &record.magnitudes {
            self.min_magnitude = self.min_magnitude.min(m as f64);
            self.max_magnitude = self.max_magnitude.max(m as f64);
        }
        let offset = record.steps.get(settled).copied().unwrap_or(0) as f64;
        self.msteps_sum += (offset / (f64::from(record.msteps) / 16.0)).abs();
        self.retries_sum += record.retries;
    }

    pub fn success_rate(&self) -> f64 {
        f64::from(self.success) / f64::from(self.count) * 100.0
    }

    /// Average correction rescaled to `microsteps`
    pub fn average_msteps(&self, microsteps: u32) -> f64 {
        self.msteps_sum / f64::from(self.count) * (f64::from(microsteps) / 16.0)
    }

    pub fn render(&self, microsteps: u32) -> String {
        let count = f64::from(self.count);
        format!(
            "{} axis statistics:\n\
             Successfully synced:     {:.2}%\n\
             Average start magnitude: {:.2}\n\
             Average end magnitude:   {:.2}\n\
             Average msteps count:    {:.0}/{}\n\
             Average retries count:   {:.2}\n\
             Min detected magnitude:  {:.2}\n\
             Max detected magnitude:  {:.2}\n\
             Synchronization count:   {}",
            self.axis.to_uppercase(),
            self.success_rate(),
            self.start_sum / count,
            self.end_sum / count,
            self.average_msteps(microsteps),
            microsteps,
            f64::from(self.retries_sum) / count,
            self.min_magnitude,
            self.max_magnitude,
            self.count,
        )
    }
}

/// Per-axis aggregates, sorted by axis name
pub fn summarize(records: &[StatsRecord]) -> Vec<AxisStats> {
    let mut by_axis: BTreeMap<&str, AxisStats> = BTreeMap::new();
    for record in records {
        by_axis
            .entry(record.axis.as_str())
            .or_insert_with(|| AxisStats::new(&record.axis))
            .add(record);
    }
    by_axis.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "motors_sync_stats_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir.join("sync_stats.jsonl")
    }

    fn record(axis: &str, status: bool, magnitudes: &[i64], steps: &[i64], msteps: u32) -> StatsRecord {
        StatsRecord {
            axis: axis.to_string(),
            status,
            magnitudes: magnitudes.to_vec(),
            steps: steps.to_vec(),
            msteps,
            retries: 1,
            date: "2024-05-01".to_string(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let path = temp_path("append");
        let store = StatsStore::open(&path);
        assert!(store.error().is_none());
        assert!(store.read().unwrap().is_empty());
        assert_eq!(store.report(|_| Some(16)), vec!["Logs are empty".to_string()]);

        let rec = record("x", true, &[9000, 4000, 600, 900], &[0, -2, -3, -4], 16);
        store.append(&rec).unwrap();
        assert_eq!(store.read().unwrap(), vec![rec]);
    }

    #[test]
    fn test_header_mismatch_disables_until_cleared() {
        let path = temp_path("header");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "axis,status\n").unwrap();
        let mut store = StatsStore::open(&path);
        assert!(store.error().is_some());
        assert!(store.report(|_| None)[0].starts_with("Statistics collection is disabled"));
        // Writes are dropped while disabled
        store.append(&record("x", true, &[1, 2], &[1, 2], 16)).unwrap();

        store.clear().unwrap();
        assert!(store.error().is_none());
        assert!(store.read().unwrap().is_empty());
        let first_line = fs::read_to_string(&path).unwrap();
        assert!(first_line.contains(STATS_FORMAT));
    }

    #[test]
    fn test_summary() {
        let records = vec![
            record("x", true, &[9000, 4000, 600, 900], &[0, -2, -3, -4], 16),
            record("x", false, &[5000, 1000, 1400], &[0, 2, 4], 32),
            record("y", true, &[3000, 200, 400], &[0, 1, 2], 16),
        ];
        let stats = summarize(&records);
        assert_eq!(stats.len(), 2);
        let x = &stats[0];
        assert_eq!(x.axis, "x");
        assert_eq!(x.count, 2);
        assert_relative_eq!(x.success_rate(), 50.0);
        assert_relative_eq!(x.start_sum, 14000.0);
        // Settled entries are 600 and 1000
        assert_relative_eq!(x.end_sum, 1600.0);
        // |-3| / 1 + |2| / 2
        assert_relative_eq!(x.msteps_sum, 4.0);
        assert_relative_eq!(x.average_msteps(32), 4.0);
        assert_relative_eq!(x.min_magnitude, 600.0);
        assert_relative_eq!(x.max_magnitude, 9000.0);
        assert!(x.render(16).starts_with("X axis statistics:"));
    }
}
