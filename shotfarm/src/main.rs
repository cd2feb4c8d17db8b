//! shotfarm - distributed shot scheduling for full-waveform inversion
//!
//! ## Commands
//!
//! - `init-model` - Write a layered true model and a smoothed starting model
//! - `forward` - Generate synthetic shot files from the true model
//! - `invert` - Run an L-BFGS inversion against the shot files
//! - `scan` - Print the shot lookup table of a SEG-Y file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shotfarm::synthetic::{self, SmoothConfig};
use shotfarm::{
    init_production_logging, init_simple_logging, segy, ClusterOrchestrator, ForwardRun,
    GridMetadata, InversionDriver, InversionSession, ModelPreset, RunConfig, RunMode,
};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Distributed shot scheduling and gradient reduction for FWI
#[derive(Parser, Debug)]
#[command(name = "shotfarm")]
#[command(about = "Distributed seismic shot simulation and FWI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a layered true model and a smoothed starting model
    InitModel {
        /// Run configuration (TOML)
        #[arg(short, long, default_value = "config/config.toml")]
        config: PathBuf,

        /// Interior grid shape, depth last (e.g. "101,51")
        #[arg(long, value_delimiter = ',', default_value = "101,51")]
        shape: Vec<usize>,

        /// Grid spacing in metres
        #[arg(long, default_value = "10.0")]
        spacing: f32,

        /// Layer velocities in km/s, shallow first
        #[arg(long, value_delimiter = ',', default_value = "1.5,2.0,2.5,3.0")]
        velocities: Vec<f32>,

        /// Smoothing passes for the starting model
        #[arg(long, default_value = "40")]
        smoothing: usize,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Generate synthetic shot files
    Forward {
        /// Run configuration (TOML)
        #[arg(short, long, default_value = "config/config.toml")]
        config: PathBuf,

        /// Overwrite geometry and solver parameters with a preset
        #[arg(short, long, value_enum)]
        preset: Option<ModelPreset>,

        /// Source peak frequency in Hz (with --preset)
        #[arg(long, default_value = "5.0")]
        fpeak: f32,

        /// Directory for rotating log files
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Log level
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Run a full-waveform inversion
    Invert {
        /// Run configuration (TOML)
        #[arg(short, long, default_value = "config/config.toml")]
        config: PathBuf,

        /// Optimizer driver
        #[arg(short, long, value_enum)]
        driver: InversionDriver,

        /// Switch the configuration to inversion with a preset's bounds
        #[arg(short, long, value_enum)]
        preset: Option<ModelPreset>,

        /// Directory for rotating log files
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Log level
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Print the shot lookup table of a SEG-Y file
    Scan {
        /// SEG-Y file
        path: PathBuf,

        /// Log level
        #[arg(short, long, default_value = "warn")]
        log_level: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::InitModel {
            config,
            shape,
            spacing,
            velocities,
            smoothing,
            log_level,
        } => {
            init_simple_logging(&log_level)?;
            cmd_init_model(&config, shape, spacing, &velocities, smoothing)?;
        }

        Commands::Forward {
            config,
            preset,
            fpeak,
            log_dir,
            log_level,
        } => {
            init_production_logging("forward", &log_level, log_dir)?;
            cmd_forward(&config, preset, fpeak).await?;
        }

        Commands::Invert {
            config,
            driver,
            preset,
            log_dir,
            log_level,
        } => {
            init_production_logging("invert", &log_level, log_dir)?;
            cmd_invert(&config, driver, preset).await?;
        }

        Commands::Scan { path, log_level } => {
            init_simple_logging(&log_level)?;
            cmd_scan(&path)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn cmd_init_model(
    config_path: &Path,
    shape: Vec<usize>,
    spacing: f32,
    velocities: &[f32],
    smoothing: usize,
) -> Result<()> {
    let config = load_config(config_path)?;
    let grid = GridMetadata {
        origin: vec![0.0; shape.len()],
        spacing: vec![spacing; shape.len()],
        shape,
    };
    let smooth = SmoothConfig {
        iterations: smoothing,
        ..Default::default()
    };

    let (truth, start) =
        synthetic::write_model_pair(&config.solver_params, &grid, velocities, &smooth)
            .context("Failed to write synthetic models")?;

    println!("True model:     {}", truth.display());
    println!("Starting model: {}", start.display());
    Ok(())
}

async fn cmd_forward(config_path: &Path, preset: Option<ModelPreset>, fpeak: f32) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(preset) = preset {
        config.apply_preset(preset, fpeak);
        config
            .save(config_path)
            .context("Failed to save preset configuration")?;
    }
    config.require_mode(RunMode::Forward)?;

    let cluster = ClusterOrchestrator::start(&config.cluster).context("Failed to start cluster")?;
    let outcome = ForwardRun::new(&cluster, &config).run().await;
    cluster.close().await?;

    match outcome {
        Ok(summary) => {
            info!(
                shots = summary.shot_ids.len(),
                partitions = summary.partitions,
                path = %config.solver_params.shotfile_path.display(),
                "Shots generated"
            );
            Ok(())
        }
        Err(e) => {
            error!(failed_shots = ?e.failed_shots(), "Forward modeling failed");
            Err(e).context("Forward modeling failed")
        }
    }
}

async fn cmd_invert(
    config_path: &Path,
    driver: InversionDriver,
    preset: Option<ModelPreset>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(preset) = preset {
        config.prepare_inversion(preset);
        config
            .save(config_path)
            .context("Failed to save preset configuration")?;
    }
    config.require_mode(RunMode::Inversion)?;
    config.slowness_bounds()?;

    let cluster = ClusterOrchestrator::start(&config.cluster).context("Failed to start cluster")?;
    let outcome = async {
        let mut session = InversionSession::new(&cluster, &config)?;
        let x0 = session.initial_slowness()?;
        let bounds = session.bounds()?;
        let final_model = driver.run_inversion(&mut session, &x0, bounds).await?;
        let path = final_model.write(&config.solver_params.results_path(), session.grid())?;
        Ok::<_, shotfarm::FwiError>((final_model, path, session.iteration_count()))
    }
    .await;
    cluster.close().await?;

    let (final_model, path, evaluations) = outcome.context("Inversion failed")?;
    info!(
        driver = ?driver,
        objective = final_model.objective,
        iterations = final_model.iterations,
        evaluations,
        stop = ?final_model.stop,
        path = %path.display(),
        "Inversion complete"
    );
    Ok(())
}

fn cmd_scan(path: &Path) -> Result<()> {
    let table = segy::scan_headers(path)
        .with_context(|| format!("Failed to scan {}", path.display()))?;

    println!("{:>6} {:>10} {:>8}  source", "shot", "offset", "traces");
    for (shot_id, header) in &table {
        println!(
            "{:>6} {:>10} {:>8}  ({:.3}, {:.3}, {:.3})",
            shot_id,
            header.trace_offset,
            header.trace_count,
            header.source[0],
            header.source[1],
            header.source[2]
        );
    }
    println!("\n{} shot(s)", table.len());
    Ok(())
}
