//! Field sync simulator CLI.
//!
//! Commands:
//! - run: Drive the engine with a synthetic hand sweeping over the array
//! - config: Print the effective configuration as TOML

use std::f32::consts::TAU;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use field_sync::{
    Command, EngineConfig, GateStatus, MaintenanceCommand, Scheduler, SensorFault, SensorSource,
    CHANNEL_COUNT,
};

#[derive(Parser)]
#[command(name = "field-sync-sim")]
#[command(version)]
#[command(about = "Hosted simulation of the field sync control loop")]
struct Cli {
    /// TOML configuration file (missing keys keep their defaults)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the loop against a synthetic sensor source
    Run {
        /// Simulated seconds
        #[arg(long, default_value = "10")]
        seconds: u32,

        /// Period of one approach/retreat sweep, in seconds
        #[arg(long, default_value = "1.2")]
        sweep_period: f32,

        /// Raw noise amplitude in counts
        #[arg(long, default_value = "2")]
        noise: u16,

        /// Calibration samples collected before the sweep starts
        #[arg(long, default_value = "50")]
        calibrate: u32,

        /// Force the gate open through maintenance access after start-up
        #[arg(long)]
        force_unlock: bool,

        /// Random seed for sensor noise
        #[arg(long, default_value = "7")]
        seed: u64,
    },

    /// Print the effective configuration
    Config,
}

/// A hand moving towards and away from the array.
///
/// Coverage follows a raised sine; covered channels read `depth` counts
/// below the idle level.
struct SweepSource {
    idle: u16,
    depth: u16,
    noise: u16,
    period_s: f32,
    time_s: f32,
    rng: ChaCha8Rng,
}

impl SweepSource {
    fn coverage(&self) -> usize {
        if self.period_s <= 0.0 || self.time_s < 0.0 {
            return 0;
        }
        let level = 0.5 - 0.5 * (TAU * self.time_s / self.period_s).cos();
        (level * CHANNEL_COUNT as f32).round() as usize
    }
}

impl SensorSource for SweepSource {
    fn read_channel(&mut self, channel: usize) -> Result<u16, SensorFault> {
        let pressed = channel < self.coverage();
        let level = if pressed { self.idle - self.depth } else { self.idle };
        let jitter = if self.noise == 0 {
            0
        } else {
            self.rng.gen_range(0..=2 * self.noise) as i32 - self.noise as i32
        };
        Ok((level as i32 + jitter).clamp(0, u16::MAX as i32) as u16)
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            EngineConfig::from_toml_str(&text)
                .with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(EngineConfig::default()),
    }
}

fn run(
    config: EngineConfig,
    seconds: u32,
    sweep_period: f32,
    noise: u16,
    calibrate: u32,
    force_unlock: bool,
    seed: u64,
) -> Result<()> {
    let loop_hz = config.scheduler.loop_rate_hz;
    let mut engine = Scheduler::uncalibrated(config)?;
    let mut source = SweepSource {
        idle: 700,
        depth: 100,
        noise,
        period_s: sweep_period,
        time_s: -1.0,
        rng: ChaCha8Rng::seed_from_u64(seed),
    };

    // Quiet array during calibration: the sweep starts at t = 0.
    if calibrate > 0 {
        engine.submit(Command::Calibrate { samples: calibrate })?;
        engine.run_for(&mut source, calibrate as u64);
        let channel = &engine.sensor().calibration().channels[0];
        info!(
            baseline_ch0 = ?channel.baseline,
            threshold_ch0 = channel.threshold,
            calibrating = engine.sensor().is_calibrating(),
            "calibrated"
        );
    }

    if force_unlock {
        let key = engine.maintenance_key()?;
        engine.submit_maintenance(&key, MaintenanceCommand::ForceUnlock)?;
    }

    let total_ticks = seconds as u64 * loop_hz as u64;
    let mut unlocked_at = None;
    for tick in 0..total_ticks {
        source.time_s = tick as f32 / loop_hz as f32;
        if let Some(snapshot) = engine.tick(&mut source) {
            debug!(
                t_ms = snapshot.time_ms,
                z = snapshot.sensor.z,
                tier = snapshot.tier(),
                gate = ?snapshot.gate.status,
                r = snapshot.oscillator.order_parameter,
                formed = snapshot.is_formed(),
                "snapshot"
            );
        }
        if unlocked_at.is_none() && engine.gate().state().status == GateStatus::Unlocked {
            unlocked_at = Some(engine.now_ms());
        }
    }

    let d = engine.diagnostics();
    let formation = engine.formation().state();
    info!(
        ticks = d.ticks,
        integration_steps = d.integration_steps,
        publications = d.publications,
        overruns = d.overruns,
        max_cycle_us = d.max_cycle_us,
        "loop finished"
    );
    info!(
        unlocked_at_ms = ?unlocked_at,
        formations = formation.total_formations,
        peak_coherence = formation.peak_coherence,
        peak_density = formation.peak_density,
        "session summary"
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            seconds,
            sweep_period,
            noise,
            calibrate,
            force_unlock,
            seed,
        } => run(
            config,
            seconds,
            sweep_period,
            noise,
            calibrate,
            force_unlock,
            seed,
        ),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
