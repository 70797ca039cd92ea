//! Volchunk
//!
//! Whole-volume processing of large 3D microscopy volumes that do not fit in
//! memory. A volume is cut into overlapping chunks, each chunk is analyzed
//! independently under a bounded worker and memory budget, and per-chunk
//! detections are merged across seams so every object is reported once.
//!
//! # Architecture
//!
//! - **Volume**: geometry, chunk footprints and the raw + sidecar storage format
//! - **Plan**: chunk planning from volume shape, overlap margin and memory budget
//! - **Pipeline**: analyzers, the admission-controlled worker pool, seam
//!   merging and the stage coordinator
//! - **I/O**: the job ledger, remote staging, the external stitcher and
//!   notifications
//!
//! # Usage
//!
//! ```no_run
//! use volchunk::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(std::path::Path::new("config.yaml"))?;
//!     let report = run_pipeline(config).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod plan;
pub mod volume;

pub use config::Config;
pub use error::{PipelineError, Result as PipelineResult};
pub use io::JobLedger;
pub use pipeline::{
    DefaultStageExecutor, PipelineCoordinator, PipelineReport, RunStatus, Stage,
    ALIGNMENT_VERIFIED,
};
pub use plan::{ChunkPlan, ChunkPlanner};
pub use volume::{RawVolume, VolumeInfo};

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Run the pipeline with the given configuration.
pub async fn run_pipeline(config: Config) -> Result<PipelineReport> {
    run_pipeline_with_cancel(config, CancellationToken::new()).await
}

/// Run the pipeline, stopping early when `cancel` fires. Progress is kept in
/// the job ledger so a later run resumes where this one stopped.
pub async fn run_pipeline_with_cancel(
    config: Config,
    cancel: CancellationToken,
) -> Result<PipelineReport> {
    config.validate()?;
    let config = Arc::new(config);

    tracing::info!("Starting volchunk pipeline");
    tracing::info!("Input volume: {}", config.input.volume);
    tracing::info!("Work directory: {}", config.work_dir.display());

    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create {}", config.work_dir.display()))?;
    let ledger = Arc::new(
        JobLedger::open(&config.ledger_path())
            .with_context(|| format!("Failed to open ledger {}", config.ledger_path().display()))?,
    );

    let executor = Arc::new(DefaultStageExecutor::new(config.clone()));
    let sink = io::build_sink(config.notify.as_ref())?;
    let coordinator = PipelineCoordinator::new(config.clone(), ledger, executor, sink)
        .with_cancellation(cancel);

    let report = coordinator.run().await?;

    let report_path = config.work_dir.join("pipeline-report.json");
    if let Err(e) = report.save_to_file(&report_path) {
        tracing::warn!("Failed to save report to {}: {}", report_path.display(), e);
    }
    tracing::info!("{}", report);
    Ok(report)
}

/// Plan chunks for the volume the process stage would read, without running
/// anything.
pub fn plan_volume(config: &Config) -> Result<(VolumeInfo, ChunkPlan, ChunkPlanner)> {
    config.validate()?;
    let ledger = JobLedger::open(&config.ledger_path())?;
    let executor = DefaultStageExecutor::new(Arc::new(config.clone()));
    let source = executor.current_volume(Stage::Process, &ledger);
    if source.starts_with("s3://") {
        anyhow::bail!("{} is remote; run the import stage before planning", source);
    }

    let volume = RawVolume::open(std::path::Path::new(&source))
        .with_context(|| format!("Failed to open volume {}", source))?;
    let info = volume.info().clone();
    let planner = ChunkPlanner::from_config(config);
    let plan = planner.plan(info.shape, info.voxel_type.size())?;
    Ok((info, plan, planner))
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
