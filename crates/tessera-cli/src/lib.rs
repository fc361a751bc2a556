//! # Tessera CLI
//!
//! Command-line tools for the Tessera residency manager.
//!
//! ## Commands
//! - `pack` - Write a synthetic tile file for a cube geometry
//! - `inspect` - Print the layout and offset table of a tile file
//! - `simulate` - Run headless frames with a rotating camera
//! - `config` - Print the effective configuration as JSON

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use tessera_core::{CubeFace, TesseraConfig};
use tessera_platform::{default_worker_threads, io_runtime};
use tessera_residency::tilefile::write_synthetic_tile_file;
use tessera_residency::{
    DeviceCommand, FeedbackCamera, MemoryTileSource, RecordingDevice, ResourceId, SamplingRenderer,
    SoftwareFeedbackPass, TileFileLayout, TileLoader, TileSource, TileTracker, TilingGeometry, TILE_SIZE_BYTES,
};

/// Texels along one edge of a tile
pub const TILE_EDGE_TEXELS: u32 = 128;

/// Tessera virtual-texture tools
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Tiling of the cube texture a command works on
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct GeometryArgs {
    /// Mip-0 width of one face in tiles
    #[arg(long, default_value = "16")]
    pub width: u32,

    /// Mip-0 height of one face in tiles
    #[arg(long, default_value = "16")]
    pub height: u32,

    /// Mip levels per face
    #[arg(long, default_value = "8")]
    pub mips: u32,

    /// First packed mip
    #[arg(long, default_value = "5")]
    pub packed_cutoff: u32,

    /// Tiles holding the packed mips of one face
    #[arg(long, default_value = "1")]
    pub packed_tiles: u32,
}

impl GeometryArgs {
    pub fn geometry(&self) -> Result<TilingGeometry> {
        Ok(TilingGeometry::cube(
            self.width,
            self.height,
            self.mips,
            self.packed_cutoff,
            self.packed_tiles,
        )?)
    }
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Write a synthetic tile file
    Pack {
        /// Output file
        output: PathBuf,

        #[command(flatten)]
        geometry: GeometryArgs,
    },

    /// Print the layout of a tile file
    Inspect {
        /// Tile file
        file: PathBuf,

        #[command(flatten)]
        geometry: GeometryArgs,
    },

    /// Run the residency manager against a rotating camera
    Simulate {
        /// Tile file to stream from; synthetic tiles when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Frames to run
        #[arg(long, default_value = "120")]
        frames: u32,

        /// Camera yaw per frame in radians
        #[arg(long, default_value = "0.05")]
        yaw_speed: f32,

        /// Camera pitch in radians
        #[arg(long, default_value = "0.2")]
        pitch: f32,

        /// Milliseconds to wait for loads after each frame
        #[arg(long, default_value = "20")]
        wait_ms: u64,

        #[command(flatten)]
        geometry: GeometryArgs,
    },

    /// Print the effective configuration
    Config,
}

/// Totals over a simulation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationReport {
    pub frames: u32,
    pub samples: usize,
    pub loads_dispatched: usize,
    pub loads_failed: usize,
    pub tiles_mapped: usize,
    pub tiles_evicted: usize,
    pub tiles_discarded: usize,
    pub tile_uploads: usize,
    pub peak_resident: usize,
    pub final_resident: usize,
}

/// Settings of one simulation run
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub file: Option<PathBuf>,
    pub frames: u32,
    pub yaw_speed: f32,
    pub pitch: f32,
    pub wait: Duration,
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    let filter = if cli.verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).try_init();

    let config = match &cli.config {
        Some(path) => TesseraConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => TesseraConfig::default(),
    };

    match cli.command {
        Commands::Pack { output, geometry } => {
            let layout = pack(&output, &geometry.geometry()?)?;
            log::info!("Wrote {} ({} tiles)", output.display(), layout.total_tiles());
        }

        Commands::Inspect { file, geometry } => {
            let geometry = geometry.geometry()?;
            let layout = inspect(&file, &geometry)?;
            print!("{}", describe_layout(&file, &geometry, &layout));
        }

        Commands::Simulate {
            file,
            frames,
            yaw_speed,
            pitch,
            wait_ms,
            geometry,
        } => {
            let options = SimulationOptions {
                file,
                frames,
                yaw_speed,
                pitch,
                wait: Duration::from_millis(wait_ms),
            };
            let report = simulate(&config, &geometry.geometry()?, &options)?;
            println!("frames:          {}", report.frames);
            println!("samples:         {}", report.samples);
            println!("loads:           {} ({} failed)", report.loads_dispatched, report.loads_failed);
            println!("mapped:          {}", report.tiles_mapped);
            println!("evicted:         {}", report.tiles_evicted);
            println!("discarded:       {}", report.tiles_discarded);
            println!("tile uploads:    {}", report.tile_uploads);
            println!("peak resident:   {}", report.peak_resident);
            println!("final resident:  {}", report.final_resident);
        }

        Commands::Config => {
            println!("{}", config.to_json_string()?);
        }
    }

    Ok(())
}

/// Write a synthetic tile file for `geometry`
pub fn pack(output: &Path, geometry: &TilingGeometry) -> Result<TileFileLayout> {
    let runtime = io_runtime(1)?;
    let layout = runtime.block_on(write_synthetic_tile_file(output, geometry))?;
    Ok(layout)
}

/// Open a tile file and index it against `geometry`
pub fn inspect(file: &Path, geometry: &TilingGeometry) -> Result<TileFileLayout> {
    let runtime = io_runtime(1)?;
    let loader = runtime
        .block_on(TileLoader::open(file, geometry))
        .with_context(|| format!("indexing {}", file.display()))?;
    Ok(loader.layout().clone())
}

/// Human-readable layout table
pub fn describe_layout(file: &Path, geometry: &TilingGeometry, layout: &TileFileLayout) -> String {
    let mut out = format!(
        "{}: {} tiles, {} bytes\n  per face: {} tiles ({} packed)\n",
        file.display(),
        layout.total_tiles(),
        layout.file_size(),
        layout.face_tiles(),
        layout.packed_tiles
    );
    for (mip, count) in layout.mip_tile_counts.iter().enumerate() {
        let tiling = geometry.subresource(CubeFace::PositiveX, mip as u32);
        let (w, h) = tiling.map_or((0, 0), |t| (t.width_in_tiles, t.height_in_tiles));
        out.push_str(&format!("  mip {:>2}: {:>6} tiles ({}x{})\n", mip, count, w, h));
    }
    for face in CubeFace::ALL {
        out.push_str(&format!("  face {}:", face));
        for mip in 0..layout.mip_tile_counts.len() as u32 {
            if let Some(first) = layout.first_tile(face, mip) {
                out.push_str(&format!(" {:#x}", first * TILE_SIZE_BYTES as u64));
            }
        }
        out.push_str(&format!(" packed {:#x}\n", layout.packed_first_tile(face) * TILE_SIZE_BYTES as u64));
    }
    out
}

/// Run headless frames and collect totals
pub fn simulate(config: &TesseraConfig, geometry: &TilingGeometry, options: &SimulationOptions) -> Result<SimulationReport> {
    config.validate()?;
    let runtime = io_runtime(default_worker_threads())?;
    let id = ResourceId(0);

    let mut device = RecordingDevice::new();
    device.define_resource(id, geometry.clone());

    let source: Arc<dyn TileSource> = match &options.file {
        Some(path) => Arc::new(
            runtime
                .block_on(TileLoader::open(path, geometry))
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Arc::new(MemoryTileSource::new(geometry.clone())),
    };

    let mut tracker = TileTracker::new(config.residency.clone(), runtime.handle().clone())?;
    tracker.register_resource(id, "sky", source, &mut device)?;

    let face_size = geometry.residency_size().1 * TILE_EDGE_TEXELS;
    let pass = SoftwareFeedbackPass::new(FeedbackCamera::default(), face_size, config.sampling.sampling_ratio);
    let mut renderer = SamplingRenderer::new(pass, config.sampling.clone())?;

    let mut report = SimulationReport {
        frames: options.frames,
        ..SimulationReport::default()
    };
    for frame in 0..options.frames {
        let yaw = frame as f32 * options.yaw_speed;
        renderer.pass_mut().set_camera(FeedbackCamera::from_yaw_pitch(
            yaw,
            options.pitch,
            std::f32::consts::FRAC_PI_2,
        ));

        let samples = renderer.sample_frame()?;
        let stats = tracker.update_tiles(&samples, &mut device)?;
        tracker.wait_for_loads(options.wait);

        report.samples += stats.samples;
        report.loads_dispatched += stats.loads_dispatched;
        report.loads_failed += stats.loads_failed;
        report.tiles_mapped += stats.tiles_mapped;
        report.tiles_evicted += stats.tiles_evicted;
        report.tiles_discarded += stats.tiles_discarded;
        report.peak_resident = report.peak_resident.max(stats.mapped);
        report.tile_uploads += device
            .take_commands()
            .iter()
            .filter(|c| matches!(c, DeviceCommand::UploadTileData { .. }))
            .count();
    }
    report.final_resident = tracker.mapped_len();

    log::info!(
        "Simulated {} frames: {} tiles mapped, {} evicted, {} resident at the end",
        report.frames,
        report.tiles_mapped,
        report.tiles_evicted,
        report.final_resident
    );
    Ok(report)
}
