//! Volchunk CLI
//!
//! Chunked whole-volume processing of large 3D microscopy volumes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volchunk::{
    build_runtime, init_rayon, plan_volume, run_pipeline_with_cancel, Config, JobLedger,
    RunStatus, Stage, ALIGNMENT_VERIFIED,
};

#[derive(Parser)]
#[command(name = "volchunk")]
#[command(about = "Chunked whole-volume processing of 3D microscopy volumes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the maximum number of concurrently running chunks
    #[arg(long, global = true)]
    max_workers: Option<usize>,

    /// Override the chunk length along the split axis, in voxels
    #[arg(long, global = true, conflicts_with = "chunk_count")]
    chunk_size: Option<usize>,

    /// Override the number of chunks
    #[arg(long, global = true)]
    chunk_count: Option<usize>,

    /// Override the overlap margin, in voxels
    #[arg(long, global = true)]
    overlap: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline, resuming from the ledger (default if no command specified)
    Run,

    /// Print the chunk plan and memory estimate without processing
    Plan,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },

    /// Print stage and chunk progress recorded in the ledger
    Status,

    /// Record that the stitch alignment has been reviewed, unblocking fusion
    VerifyAlignment,

    /// Clear a stage and every stage after it so they run again
    Reset {
        /// Stage name (stitch-align, stitch-fuse, import, transpose, process, upload)
        stage: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli)?;
            run_command(config)?;
        }

        Some(Commands::Plan) => {
            let config = load_config(&cli)?;
            plan_command(&config)?;
        }

        Some(Commands::Validate) => {
            load_config(&cli)?;
            println!("Configuration is valid");
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }

        Some(Commands::Status) => {
            let config = load_config(&cli)?;
            status_command(&config)?;
        }

        Some(Commands::VerifyAlignment) => {
            let config = load_config(&cli)?;
            let ledger = JobLedger::open(&config.ledger_path())?;
            ledger.set_signal(ALIGNMENT_VERIFIED)?;
            println!("Alignment marked as verified; rerun to fuse");
        }

        Some(Commands::Reset { stage }) => {
            let config = load_config(&cli)?;
            reset_command(&config, stage)?;
        }
    }

    Ok(())
}

/// Load the configuration file, apply command-line overrides and validate.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    if let Some(workers) = cli.max_workers {
        config.processing.max_workers = Some(workers);
    }
    if let Some(size) = cli.chunk_size {
        config.chunking.chunk_size = Some(size);
        config.chunking.chunk_count = None;
    }
    if let Some(count) = cli.chunk_count {
        config.chunking.chunk_count = Some(count);
        config.chunking.chunk_size = None;
    }
    if let Some(overlap) = cli.overlap {
        config.chunking.overlap_margin = Some(overlap);
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config: Config) -> Result<()> {
    // Initialize Rayon
    init_rayon(config.processing.rayon_threads)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    let report = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after in-flight work");
                on_signal.cancel();
            }
        });
        run_pipeline_with_cancel(config, cancel).await
    });
    // Analyses abandoned after the cancellation grace period must not keep
    // the process alive.
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));
    let report = report?;

    println!("\n{}", report);
    match report.status {
        RunStatus::Completed | RunStatus::CompletedWithPartialFailures => Ok(()),
        RunStatus::AwaitingSignal => {
            println!("Run `volchunk verify-alignment` once the alignment is checked, then rerun.");
            Ok(())
        }
        RunStatus::Halted | RunStatus::Cancelled => {
            let stage = report
                .resume_from
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            anyhow::bail!("pipeline {} at stage '{}'; rerun to resume", report.status, stage)
        }
    }
}

fn plan_command(config: &Config) -> Result<()> {
    let (info, plan, planner) = plan_volume(config)?;

    println!("\n=== Volume ===");
    println!("Shape: {} ({} channel(s), {:?})", info.shape, info.shape.channels, info.voxel_type);
    println!(
        "Resolution: {:.3} x {:.3} x {:.3} µm",
        info.resolution[0], info.resolution[1], info.resolution[2]
    );
    println!(
        "Data size: {:.2} GB",
        info.data_len() as f64 / (1024.0 * 1024.0 * 1024.0)
    );

    let footprint = plan.footprint();
    println!("\n=== Chunk Plan ===");
    println!("Split axis: {}", footprint.axis);
    println!("Chunk length: {} voxels", footprint.length);
    println!("Overlap margin: {} voxels", footprint.margin);
    println!("Chunks: {}", plan.len());
    for region in plan.regions() {
        println!("  {}", region);
    }

    println!("\n=== Memory Estimate ===");
    let gb = |bytes: u64| bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    println!("Peak per chunk: {:.2} GB", gb(plan.peak_chunk_bytes()));
    println!("Pool budget: {:.2} GB", gb(planner.memory_budget()));
    println!("Workers: {}", config.processing.worker_limit());
    println!("==================\n");
    Ok(())
}

fn status_command(config: &Config) -> Result<()> {
    let ledger = JobLedger::open(&config.ledger_path())?;
    let snapshot = ledger.snapshot();

    println!("\n=== Stages ===");
    for stage in Stage::ALL {
        match snapshot.stages.get(stage.name()) {
            Some(entry) => {
                print!("{:<13} {:<10} attempts: {}", stage.name(), entry.status.to_string(), entry.attempts);
                if let Some(message) = &entry.message {
                    print!("  {}", message);
                }
                println!();
            }
            None => println!("{:<13} {:<10}", stage.name(), "pending"),
        }
    }

    println!("\n=== Chunks ===");
    if let Some(fingerprint) = &snapshot.plan_fingerprint {
        println!("Plan: {}", fingerprint);
    }
    for (status, count) in ledger.chunk_counts() {
        println!("{:<10} {}", status.to_string(), count);
    }
    for (index, entry) in &snapshot.chunks {
        if let Some(message) = entry.message.as_ref().filter(|_| !entry.status.is_succeeded()) {
            println!("  chunk {}: {} ({})", index, entry.status, message);
        }
    }

    if !snapshot.signals.is_empty() {
        println!("\n=== Signals ===");
        for (name, at) in &snapshot.signals {
            println!("{} at {}", name, at);
        }
    }
    println!();
    Ok(())
}

fn reset_command(config: &Config, stage: &str) -> Result<()> {
    let stage = Stage::from_name(stage).with_context(|| {
        let names: Vec<&str> = Stage::ALL.iter().map(|s| s.name()).collect();
        format!("Unknown stage '{}', expected one of {}", stage, names.join(", "))
    })?;
    let ledger = JobLedger::open(&config.ledger_path())?;
    let names: Vec<&str> = stage.and_after().iter().map(|s| s.name()).collect();
    ledger.reset_stages(&names, Stage::Process.name())?;
    println!("Reset {}", names.join(", "));
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# Volchunk Pipeline Configuration

# === INPUT: The volume to process ===
input:
  # Local volume (path to the .json sidecar, the .raw file, or their common stem)
  # or a remote one: "s3://bucket/scans/brain.raw"
  volume: "/data/brain/brain.json"

  # Analyze a single channel (omit = all channels)
  # channel: 0

  # Metadata overrides applied at import
  # resolution: [2.0, 0.65, 0.65]   # z, y, x in µm
  # magnification: 10.0
  # zoom: 1.0

# === PROFILE: Object detection ===
profile:
  kind: peaks

  # Largest object radius in voxels (required); the overlap margin must cover it
  max_object_radius: 6.0

  # Minimum intensity of a peak
  threshold: 1000

  # Peaks closer than this (in voxels) are merged into the brightest
  min_separation: 3

# === CHUNKING: How the volume is cut ===
chunking:
  # Split axis: z, y or x (omit = longest axis)
  # axis: x

  # Chunk length along the split axis OR number of chunks (omit both = size from memory)
  # chunk_size: 200
  # chunk_count: 8

  # Overlap margin in voxels (omit = max(ceil(max_object_radius), min_separation + 1))
  # overlap_margin: 20

  min_chunk_len: 16
  max_chunk_len: 4096
  max_chunks: 1024

  # Estimated working memory per voxel and channel during analysis
  bytes_per_voxel_cost: 16.0

  # Share of available memory the worker pool may use
  memory_fraction: 0.5

  # Fixed memory budget instead of querying the system
  # memory_budget_gb: 32

# === PROCESSING: Performance tuning ===
processing:
  # Concurrently running chunks (null = num CPUs)
  # max_workers: 8

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Rayon thread pool size for analysis (null = num CPUs)
  # rayon_threads: 8

  # Retries for a failing chunk before it is reported as a gap
  chunk_retries: 1

  # Fail the process stage when more than this share of chunks fail
  max_failed_fraction: 0.1

  # Seconds in-flight chunks may run after cancellation
  cancel_grace_secs: 30

  # Print throughput metrics during processing
  enable_metrics: true
  metrics_interval_secs: 10
  # metrics_output_path: "metrics.json"

# === STAGES: Which stages run ===
stages:
  stitch: false
  import: true
  transpose: false
  process: true
  upload: false

# === STITCH: External tile stitcher (needed when stages.stitch is true) ===
# stitch:
#   program: "/opt/stitcher/bin/stitch"
#   extra_args: []
#   tile_grid: [4, 6]        # rows, columns
#   tile_size: [2048, 2048]  # per-tile y, x in pixels
#   overlap_fraction: 0.1
#   directionality: right-down
#   timeout_secs: 21600

# === TRANSPOSE: Re-orientation and rescaling ===
transpose:
  plane: xy        # xy, xz or yz
  # rescale: 0.5

# === REMOTE: Upload destination (needed when stages.upload is true) ===
# Choose ONE of: local_path OR bucket+prefix
# remote:
#   bucket: "lab-results"
#   prefix: "volchunk/brain"
#   # local_path: "/mnt/results/brain"
#   include_pattern: "*.json"

# === NOTIFY: Stage status webhook (optional) ===
# notify:
#   url: "https://hooks.example.org/volchunk"
#   timeout_secs: 10

# === RETRY: Stage-level retries of transient failures ===
retry:
  max_retries: 3
  initial_backoff_ms: 100
  max_backoff_ms: 10000

# Ledger, chunk artifacts and outputs
work_dir: "volchunk-work"
"#;

fn generate_config_command(output: &Path) -> Result<()> {
    std::fs::write(output, SAMPLE_CONFIG)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["volchunk"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_with_config() {
        let cli = Cli::try_parse_from(["volchunk", "-c", "other.yaml"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_cli_parse_overrides() {
        let cli = Cli::try_parse_from([
            "volchunk", "plan", "--max-workers", "4", "--chunk-size", "200", "--overlap", "20",
        ])
        .unwrap();
        assert_eq!(cli.max_workers, Some(4));
        assert_eq!(cli.chunk_size, Some(200));
        assert_eq!(cli.overlap, Some(20));
        assert!(matches!(cli.command, Some(Commands::Plan)));
    }

    #[test]
    fn test_cli_chunk_size_and_count_conflict() {
        let cli = Cli::try_parse_from(["volchunk", "--chunk-size", "200", "--chunk-count", "4"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_cli_parse_reset() {
        let cli = Cli::try_parse_from(["volchunk", "reset", "transpose"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Reset { ref stage }) if stage == "transpose"));
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = Config::from_yaml(SAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.profile.max_object_radius, 6.0);
        assert_eq!(config.overlap_margin(), 6);
    }

    #[test]
    fn test_overrides_applied_and_validated() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE_CONFIG).unwrap();

        let cli = Cli::try_parse_from([
            "volchunk", "-c", path.to_str().unwrap(), "--chunk-count", "4", "--overlap", "8",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.chunking.chunk_count, Some(4));
        assert_eq!(config.overlap_margin(), 8);

        // A margin smaller than the object radius is rejected.
        let cli =
            Cli::try_parse_from(["volchunk", "-c", path.to_str().unwrap(), "--overlap", "2"]).unwrap();
        assert!(load_config(&cli).is_err());
    }
}
