use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};

use motors_sync::{
    CalibrateOptions, LogReporter, MotorsSync, RunOptions, SimConfig, SimMachine, StatsStore,
    SyncConfig,
};

/// Used when no `--config` is given: a CoreXY machine with one accelerometer
const DEFAULT_CONFIG: &str = r#"{
    "kinematics": "corexy",
    "defaults": { "accel_chip": "adxl345" },
    "axis": {
        "x": { "stepper": { "rotation_distance": 40, "position_max": 300 } },
        "y": { "stepper": { "rotation_distance": 40, "position_max": 300 } }
    }
}"#;

#[derive(Parser, Debug)]
#[command(name = "motors_sync")]
#[command(about = "Dual-motor axis phase synchronization on a simulated machine", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synchronize the motors of the configured axes
    Sync {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Comma separated subset of axes, e.g. "x,y"
        #[arg(long)]
        axes: Option<String>,

        /// Accelerometer used instead of the configured one
        #[arg(long)]
        accel_chip: Option<String>,

        #[arg(long)]
        retry_tolerance: Option<f64>,

        /// Per axis tolerance, e.g. "x=500" (repeatable)
        #[arg(long, value_name = "AXIS=VALUE")]
        axis_tolerance: Vec<String>,

        #[arg(long)]
        retries: Option<u32>,

        /// Per axis retries, e.g. "y=3" (repeatable)
        #[arg(long, value_name = "AXIS=VALUE")]
        axis_retries: Vec<String>,

        /// Correct even when all axes start in tolerance
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Initial phase mismatch of a simulated axis in microsteps (repeatable)
        #[arg(long, value_name = "AXIS=MSTEPS")]
        offset: Vec<String>,

        /// Statistics log (JSON lines)
        #[arg(long)]
        stats: Option<PathBuf>,

        /// Write the final status as JSON here
        #[arg(long)]
        status: Option<String>,
    },

    /// Record magnitude against microstep offset for model fitting
    Calibrate {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        axis: Option<String>,

        #[arg(long)]
        repeats: Option<u32>,

        /// Magnitude the sweep rises to
        #[arg(long)]
        peak_point: Option<f64>,

        #[arg(long, value_name = "AXIS=MSTEPS")]
        offset: Vec<String>,

        /// Output file for the collected samples
        #[arg(long, default_value = "calibration.json")]
        output: PathBuf,
    },

    /// Summarize or reset the statistics log
    Stats {
        #[arg(long, default_value = "sync_stats.jsonl")]
        stats: PathBuf,

        /// Configuration used to scale the average correction
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        clear: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => SyncConfig::from_json(DEFAULT_CONFIG)?,
    };
    Ok(config)
}

/// Parse repeated `axis=value` arguments
fn parse_pairs<T: FromStr>(pairs: &[String]) -> Result<BTreeMap<String, T>> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        let (axis, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected AXIS=VALUE, got '{}'", pair))?;
        let value = value
            .trim()
            .parse()
            .map_err(|_| anyhow!("invalid value in '{}'", pair))?;
        map.insert(axis.trim().to_lowercase(), value);
    }
    Ok(map)
}

fn simulated_machine(offsets: &[String]) -> Result<SimMachine> {
    let mut cfg = SimConfig::default();
    cfg.offsets.extend(parse_pairs::<f64>(offsets)?);
    Ok(SimMachine::new(cfg))
}

fn report_offsets(sim: &SimMachine, axes: &[String]) {
    for axis in axes {
        log::info!(
            "Simulated {} mismatch: {:.2} microsteps",
            axis.to_uppercase(),
            sim.offset_msteps(axis)
        );
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Sync {
            config,
            axes,
            accel_chip,
            retry_tolerance,
            axis_tolerance,
            retries,
            axis_retries,
            force,
            offset,
            stats,
            status,
        } => {
            let plan = load_config(config.as_ref())?.configure()?;
            let names: Vec<String> = plan.axes.iter().map(|a| a.name.clone()).collect();
            let sim = simulated_machine(&offset)?;
            report_offsets(&sim, &names);

            let mut sync = MotorsSync::attach(plan, sim.clone(), Box::new(LogReporter))?;
            if let Some(path) = stats {
                sync = sync.with_stats(StatsStore::open(path));
            }
            let opts = RunOptions {
                axes: axes.map(|list| list.split(',').map(|a| a.trim().to_string()).collect()),
                accel_chip,
                retry_tolerance,
                axis_retry_tolerance: parse_pairs(&axis_tolerance)?,
                retries,
                axis_retries: parse_pairs(&axis_retries)?,
                force,
                ..RunOptions::default()
            };
            let result = sync.run(&opts);
            if let Some(path) = &status {
                sync.status()
                    .save(path)
                    .with_context(|| format!("cannot write status {}", path))?;
            }
            let report = result?;
            for axis in &report.axes {
                println!(
                    "{}: {} {} --> {}, moved {}/{} step",
                    axis.name.to_uppercase(),
                    axis.dim_type,
                    axis.initial_magnitude,
                    axis.magnitude,
                    axis.msteps,
                    axis.microsteps
                );
            }
            report_offsets(&sim, &names);
        }

        Command::Calibrate {
            config,
            axis,
            repeats,
            peak_point,
            offset,
            output,
        } => {
            let plan = load_config(config.as_ref())?.configure()?;
            let sim = simulated_machine(&offset)?;
            let mut sync = MotorsSync::attach(plan, sim, Box::new(LogReporter))?;
            let samples = sync.calibrate(&CalibrateOptions {
                axis,
                repeats,
                peak_point,
            })?;
            samples
                .save(&output)
                .with_context(|| format!("cannot write {}", output.display()))?;
            println!(
                "{} samples of {} axis written to {}",
                samples.y.len(),
                samples.axis.to_uppercase(),
                output.display()
            );
        }

        Command::Stats {
            stats,
            config,
            clear,
        } => {
            let mut store = StatsStore::open(&stats);
            if clear {
                store.clear()?;
                println!("Statistics cleared");
                return Ok(());
            }
            let plan = match &config {
                Some(_) => Some(load_config(config.as_ref())?.configure()?),
                None => None,
            };
            let microsteps_of = |axis: &str| {
                plan.as_ref()
                    .and_then(|p| p.axis(axis))
                    .map(|a| a.microsteps)
            };
            for msg in store.report(microsteps_of) {
                println!("{}\n", msg);
            }
        }
    }
    Ok(())
}
