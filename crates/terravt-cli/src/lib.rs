//! # Terravt CLI
//!
//! Command-line front end for Terravt terrain virtual texturing.
//!
//! ## Commands
//! - `simulate` - Run the pipeline headless over the software device
//! - `sweep` - Stress the virtual image allocator
//! - `config` - Print or write the default configuration

use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use glam::{UVec2, Vec3};

use terravt_core::{SweepReport, VirtualTextureConfig, run_allocator_sweep};
use terravt_renderer::{
    FrameInput, PipelineStats, SoftwareDevice, VirtualTextureSystem, sample_visible_pages,
};

/// Rings of ground samples fed to the software feedback pass
const SAMPLE_RINGS: u32 = 5;
const SAMPLES_PER_RING: u32 = 24;

/// Terravt virtual texturing CLI
#[derive(Parser)]
#[command(name = "terravt")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Drive the pipeline over the software device along a circular camera path
    Simulate {
        /// Number of frames to run
        #[arg(short, long, default_value = "600")]
        frames: u32,

        /// Terrain extent in world units
        #[arg(short, long)]
        terrain_size: Option<u32>,

        /// Viewport as WIDTHxHEIGHT
        #[arg(long, default_value = "1920x1080", value_parser = parse_viewport)]
        viewport: UVec2,

        /// Frames before a readback completes
        #[arg(short, long, default_value = "2")]
        latency: u32,

        /// Camera speed in world units per frame
        #[arg(short, long, default_value = "1.0")]
        speed: f32,

        /// Configuration JSON
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Sweep the camera over the centre sector of a square block of sectors
    Sweep {
        /// Side of the sector block
        #[arg(short, long, default_value = "9")]
        range: u32,

        /// Configuration JSON
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the default configuration, or write it to a file
    Config {
        /// Terrain extent in world units
        #[arg(short, long)]
        terrain_size: Option<u32>,

        /// Output file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Parameters of a headless simulation run
#[derive(Debug, Clone)]
pub struct Simulation {
    pub config: VirtualTextureConfig,
    pub frames: u32,
    pub viewport: UVec2,
    pub latency: u32,
    pub speed: f32,
}

/// Final state of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub stats: PipelineStats,
    pub tracked_sectors: usize,
    pub drained: bool,
}

fn parse_viewport(value: &str) -> Result<UVec2, String> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{value}'"))?;
    let width: u32 = width.trim().parse().map_err(|e| format!("invalid width: {e}"))?;
    let height: u32 = height.trim().parse().map_err(|e| format!("invalid height: {e}"))?;
    if width == 0 || height == 0 {
        return Err("viewport must not be empty".into());
    }
    Ok(UVec2::new(width, height))
}

fn load_config(path: Option<&Path>, terrain_size: Option<u32>) -> Result<VirtualTextureConfig> {
    let mut config = match path {
        Some(path) => VirtualTextureConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => VirtualTextureConfig::default(),
    };
    if let Some(terrain_size) = terrain_size {
        config.terrain_size = terrain_size;
    }
    config.validate()?;
    Ok(config)
}

/// Camera position on a circle around the terrain centre
fn camera_on_path(config: &VirtualTextureConfig, frame: u32, speed: f32) -> Vec3 {
    let half = config.terrain_size as f32 * 0.5;
    let radius = (half * 0.5).max(1.0);
    let angle = (frame as f32 * speed / radius) % TAU;
    Vec3::new(half + radius * angle.cos(), 2.0, half + radius * angle.sin())
}

/// Run `simulation` to completion and shut the system down
pub fn run_simulation(simulation: &Simulation) -> Result<SimulationOutcome> {
    let device = SoftwareDevice::new();
    device.readback_control().set_latency(simulation.latency);
    let mut system = VirtualTextureSystem::new(simulation.config.clone(), device)?;

    for frame in 0..simulation.frames {
        let camera = camera_on_path(&simulation.config, frame, simulation.speed);
        let visible = sample_visible_pages(system.context(), camera, SAMPLE_RINGS, SAMPLES_PER_RING);
        system.device_mut().set_visible_pages(visible);
        system
            .execute_frame(FrameInput {
                camera_position: camera,
                viewport: simulation.viewport,
            })
            .with_context(|| format!("frame {frame}"))?;
    }

    let tracked_sectors = system.context().sector_count();
    let stats = system.stats().clone();
    let drained = system.shutdown(Duration::from_millis(250));
    Ok(SimulationOutcome {
        stats,
        tracked_sectors,
        drained,
    })
}

fn log_sweep(report: &SweepReport) -> Result<()> {
    log::info!("Sweep report:\n{}", serde_json::to_string_pretty(report)?);
    if report.failed_inserts > 0 {
        bail!("{} virtual image inserts failed", report.failed_inserts);
    }
    Ok(())
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Simulate {
            frames,
            terrain_size,
            viewport,
            latency,
            speed,
            config,
        } => {
            let config = load_config(config.as_deref(), terrain_size)?;
            log::info!("Simulating {} frames over a {} unit terrain...", frames, config.terrain_size);
            log::info!("  Viewport: {}x{}", viewport.x, viewport.y);
            log::info!("  Readback latency: {} frames", latency);

            let outcome = run_simulation(&Simulation {
                config,
                frames,
                viewport,
                latency,
                speed,
            })?;
            log::info!("Pipeline stats:\n{}", serde_json::to_string_pretty(&outcome.stats)?);
            log::info!("  Sectors tracked at exit: {}", outcome.tracked_sectors);
            if !outcome.drained {
                log::warn!("A readback was still in flight at shutdown");
            }
        }

        Commands::Sweep { range, config } => {
            let config = load_config(config.as_deref(), None)?;
            if range == 0 || range > config.sector_count() {
                bail!("sweep range must be between 1 and {}", config.sector_count());
            }
            log::info!("Sweeping a {range}x{range} sector block...");
            log_sweep(&run_allocator_sweep(&config, range))?;
        }

        Commands::Config { terrain_size, output } => {
            let config = load_config(None, terrain_size)?;
            match output {
                Some(output) => {
                    config.save_json(&output)?;
                    log::info!("Configuration written to {}", output.display());
                }
                None => println!("{}", config.to_json_string()?),
            }
        }
    }

    Ok(())
}
