//! Stage implementations.
//!
//! ```text
//! stitch-align ─▶ stitch-fuse ─▶ import ─▶ transpose ─▶ process ─▶ upload
//!   (external)    (gated on      (fetch,    (re-orient,  (plan, pool,
//!                  signal)        validate)  rescale)     merge)
//! ```
//!
//! Each volume-producing stage records the path of the volume it wrote as its
//! ledger artifact. A stage reads the artifact of the latest enabled producer
//! before it, or the configured input when there is none, so a resumed job
//! picks up exactly where the earlier run left its data.

use crate::config::{Config, InputConfig, StitchConfig};
use crate::error::{PipelineError, Result};
use crate::io::{
    create_output_store, output_prefix, parse_s3_uri, store_for_uri, EntryStatus, JobLedger,
    LedgerEntry, RemoteStagingClient, StitchPhase, Stitcher,
};
use crate::pipeline::analyzer::{build_analyzer, ChunkAnalyzer};
use crate::pipeline::coordinator::{
    Stage, StageContext, StageExecutor, StageOutcome, StageSummary, ALIGNMENT_VERIFIED,
};
use crate::pipeline::merger::{SeamMerger, WholeVolumeResult};
use crate::pipeline::worker_pool::{ChunkArtifacts, PoolSettings, WorkerPool};
use crate::pipeline::{Metrics, MetricsReporter, MetricsSnapshot};
use crate::plan::ChunkPlanner;
use crate::volume::{
    volume_paths, Plane, RawVolume, RawVolumeWriter, VolumeInfo, VolumeShape, VolumeSource,
};
use futures::future::BoxFuture;
use ndarray::Array3;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stages whose artifact is a volume, latest first.
const VOLUME_PRODUCERS: [Stage; 3] = [Stage::Transpose, Stage::Import, Stage::StitchFuse];

/// Merged objects written by the process stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectsFile {
    /// Volume the objects were detected in
    pub volume: String,
    /// Voxel size in µm, `[z, y, x]`
    pub resolution: [f64; 3],
    /// Fingerprint of the chunk plan
    pub plan: String,
    #[serde(flatten)]
    pub result: WholeVolumeResult,
}

impl ObjectsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::NotFound(path.display().to_string()),
            _ => PipelineError::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Human-readable summary written next to the objects.
#[derive(Debug, Clone, Serialize)]
struct ProcessReport {
    volume: String,
    shape: String,
    plan: String,
    chunks_total: usize,
    chunks_resumed: usize,
    chunks_merged: usize,
    object_count: usize,
    objects_discarded_at_seams: usize,
    failed_regions: Vec<String>,
    metrics: MetricsSnapshot,
}

/// Runs the built-in stages against the local work directory.
pub struct DefaultStageExecutor {
    config: Arc<Config>,
    analyzer: Arc<dyn ChunkAnalyzer>,
    metrics: Arc<Metrics>,
    input_store: Option<Arc<dyn ObjectStore>>,
    output_store: Option<Arc<dyn ObjectStore>>,
}

impl DefaultStageExecutor {
    pub fn new(config: Arc<Config>) -> Self {
        let analyzer = build_analyzer(&config);
        Self {
            config,
            analyzer,
            metrics: Metrics::new(),
            input_store: None,
            output_store: None,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ChunkAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Store remote inputs are fetched from instead of the one named by the URI.
    pub fn with_input_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.input_store = Some(store);
        self
    }

    /// Store outputs are uploaded to instead of the configured destination.
    pub fn with_output_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.output_store = Some(store);
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn work_path(&self, name: &str) -> PathBuf {
        self.config.work_dir.join(name)
    }

    fn stitch_config(&self) -> Result<&StitchConfig> {
        self.config
            .stitch
            .as_ref()
            .ok_or_else(|| PipelineError::config("stitch stage enabled without a stitch section"))
    }

    /// Volume `stage` reads.
    pub fn current_volume(&self, stage: Stage, ledger: &JobLedger) -> String {
        VOLUME_PRODUCERS
            .into_iter()
            .filter(|&producer| producer < stage && producer.is_enabled(&self.config))
            .find_map(|producer| {
                ledger
                    .stage(producer.name())
                    .filter(|e| e.status.is_succeeded())
                    .and_then(|e| e.artifact)
            })
            .unwrap_or_else(|| self.config.input.volume.clone())
    }

    async fn stitch_align(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let stitcher = Stitcher::new(self.stitch_config()?.clone()).with_cancellation(ctx.cancel.clone());
        // A new alignment has not been reviewed yet.
        ctx.ledger.clear_signal(ALIGNMENT_VERIFIED)?;

        let output = self.work_path("stitch").join("alignment.json");
        let input = PathBuf::from(&self.config.input.volume);
        let alignment = stitcher.run(StitchPhase::Align, &input, &output, None).await?;
        Ok(completed(
            &alignment,
            format!("alignment written to {}; verify before fusing", alignment.display()),
        ))
    }

    async fn stitch_fuse(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let alignment = ctx
            .ledger
            .stage(Stage::StitchAlign.name())
            .and_then(|e| e.artifact)
            .ok_or_else(|| PipelineError::stage_fatal(Stage::StitchFuse.name(), "no alignment recorded"))?;

        if !ctx.ledger.has_signal(ALIGNMENT_VERIFIED) {
            return Ok(StageOutcome::AwaitingSignal {
                signal: ALIGNMENT_VERIFIED.to_string(),
                message: format!("review {} and record the alignment as verified", alignment),
            });
        }

        let stitcher = Stitcher::new(self.stitch_config()?.clone()).with_cancellation(ctx.cancel.clone());
        let input = PathBuf::from(&self.config.input.volume);
        let output = self.work_path("stitch").join("fused");
        stitcher
            .run(StitchPhase::Fuse, &input, &output, Some(Path::new(&alignment)))
            .await?;
        let (sidecar, _) = volume_paths(&output);
        Ok(completed(&sidecar, format!("fused volume {}", sidecar.display())))
    }

    async fn import(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let source = self.current_volume(Stage::Import, &ctx.ledger);
        let import_dir = self.work_path("import");

        let local = if source.starts_with("s3://") {
            self.fetch_volume(&source, &import_dir, &ctx.cancel).await?
        } else {
            PathBuf::from(&source)
        };

        let input = self.config.input.clone();
        let (sidecar, info) =
            blocking(Stage::Import, move || import_volume(&local, &input, &import_dir)).await?;
        Ok(completed(
            &sidecar,
            format!(
                "{} ({} channel(s), {:?}, {:?} µm)",
                info.shape, info.shape.channels, info.voxel_type, info.resolution
            ),
        ))
    }

    /// Fetch the sidecar and data of a remote volume into `import_dir`.
    async fn fetch_volume(
        &self,
        uri: &str,
        import_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let (store, key) = match &self.input_store {
            Some(store) => (Arc::clone(store), ObjectPath::from(parse_s3_uri(uri)?.1)),
            None => store_for_uri(uri)?,
        };
        let key = key.to_string();
        let stem = key
            .strip_suffix(".json")
            .or_else(|| key.strip_suffix(".raw"))
            .unwrap_or(&key);
        let name = stem.rsplit('/').next().unwrap_or(stem);
        let (sidecar, data) = volume_paths(&import_dir.join(name));

        let client = RemoteStagingClient::new(store, self.config.retry.clone())
            .with_cancellation(cancel.clone());
        client
            .fetch(&ObjectPath::from(format!("{}.json", stem)), &sidecar)
            .await?;
        client
            .fetch(&ObjectPath::from(format!("{}.raw", stem)), &data)
            .await?;
        Ok(sidecar)
    }

    async fn transpose(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let source = PathBuf::from(self.current_volume(Stage::Transpose, &ctx.ledger));
        let plane = self.config.transpose.plane;
        let rescale = self.config.transpose.rescale.unwrap_or(1.0);

        if plane == Plane::Xy && rescale == 1.0 {
            let (sidecar, _) = volume_paths(&source);
            return Ok(completed(&sidecar, "identity orientation, volume used as is".to_string()));
        }

        let name = source
            .with_extension("")
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "volume".to_string());
        let plane_name = format!("{:?}", plane).to_lowercase();
        let target = self
            .work_path("transpose")
            .join(format!("{}_{}", name, plane_name));
        let cancel = ctx.cancel.clone();
        let info = blocking(Stage::Transpose, move || {
            transpose_volume(&source, &target, plane, rescale, &cancel).map(|info| (target, info))
        })
        .await?;
        let (target, info) = info;
        let (sidecar, _) = volume_paths(&target);
        Ok(completed(
            &sidecar,
            format!("{} in {} orientation, scale {}", info.shape, plane_name, rescale),
        ))
    }

    async fn process(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let source = self.current_volume(Stage::Process, &ctx.ledger);
        if source.starts_with("s3://") {
            return Err(PipelineError::config("remote volumes must be imported before processing"));
        }
        let volume = RawVolume::open(Path::new(&source))?;
        let info = volume.info().clone();

        let planner = ChunkPlanner::from_config(&self.config);
        if planner.margin() < self.analyzer.required_margin() {
            return Err(PipelineError::config(format!(
                "overlap margin {} is smaller than the {} analyzer needs ({})",
                planner.margin(),
                self.analyzer.name(),
                self.analyzer.required_margin()
            )));
        }
        let plan = planner.plan(info.shape, info.voxel_type.size())?;
        let fingerprint = plan.fingerprint();
        if ctx.ledger.bind_plan(&fingerprint)? {
            info!("Chunk plan changed since the last run, processing all chunks");
        }

        // Chunks that succeeded in an earlier run are merged from their artifacts.
        let mut merger = SeamMerger::new(info.shape);
        let succeeded = ctx.ledger.succeeded_chunks();
        let mut pending = Vec::new();
        for region in plan.regions() {
            let artifact = succeeded.get(&region.index).and_then(|a| a.as_deref());
            match artifact.map(|path| ChunkArtifacts::load(Path::new(path))) {
                Some(Ok(result)) if result.region == *region && result.is_succeeded() => {
                    let claimed = merger.merge(&result);
                    self.metrics.add_chunk_resumed();
                    self.metrics.add_objects_claimed(claimed as u64);
                }
                Some(Err(e)) => {
                    warn!("Chunk {} artifact unusable, recomputing: {}", region.index, e);
                    pending.push(*region);
                }
                _ => pending.push(*region),
            }
        }
        let total = plan.len();
        let resumed = total - pending.len();
        info!(
            "Processing {} of {} chunks along {} ({} resumed, margin {})",
            pending.len(),
            total,
            plan.footprint().axis,
            resumed,
            plan.footprint().margin
        );

        let processing = &self.config.processing;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if processing.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                processing.metrics_interval_secs,
                total as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let settings = PoolSettings::from_config(&self.config, &planner, info.shape.channels);
        let source_volume: Arc<dyn VolumeSource> = Arc::new(volume);
        let pool = Arc::new(
            WorkerPool::new(
                source_volume,
                Arc::clone(&self.analyzer),
                Arc::clone(&ctx.ledger),
                Arc::clone(&self.metrics),
                settings,
            )
            .with_cancellation(&ctx.cancel),
        );

        let tolerated = processing.tolerated_failures(total);
        let mut tripped = None;
        let mut failed = 0usize;
        // The result channel closes only after every worker task has exited,
        // so no chunk is still writing to the ledger once this loop ends.
        let results = pool.run(pending.clone());
        while let Ok(result) = results.recv().await {
            if result.status == EntryStatus::Failed {
                failed += 1;
                if failed > tolerated && tripped.is_none() {
                    let message = format!(
                        "{} of {} chunks failed, above the limit of {} ({:.0}%)",
                        failed,
                        total,
                        tolerated,
                        processing.max_failed_fraction * 100.0
                    );
                    warn!("Circuit breaker tripped: {}", message);
                    pool.cancel();
                    tripped = Some(message);
                }
            }
            let claimed = merger.merge(&result);
            self.metrics.add_objects_claimed(claimed as u64);
        }

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }
        if processing.enable_metrics {
            MetricsReporter::new(
                self.metrics.clone(),
                processing.metrics_interval_secs,
                total as u64,
            )
            .print_summary();
            if let Some(path) = &processing.metrics_output_path {
                if let Err(e) = self.metrics.snapshot().save_to_file(path) {
                    warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        if let Some(message) = tripped {
            return Err(PipelineError::stage_fatal(Stage::Process.name(), message));
        }
        if ctx.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(format!(
                "process stage after {} of {} chunks",
                merger.merged_chunks(),
                total
            )));
        }

        let merged = merger.finish();
        let output_dir = self.work_path("output");
        let objects = ObjectsFile {
            volume: source.clone(),
            resolution: info.resolution,
            plan: fingerprint.clone(),
            result: merged,
        };
        let report = ProcessReport {
            volume: source,
            shape: info.shape.to_string(),
            plan: fingerprint,
            chunks_total: total,
            chunks_resumed: resumed,
            chunks_merged: objects.result.chunks_merged,
            object_count: objects.result.object_count,
            objects_discarded_at_seams: objects.result.objects_discarded_at_seams,
            failed_regions: objects
                .result
                .gaps
                .iter()
                .map(|g| format!("chunk {} {}: {}", g.region.index, g.region.inner, g.reason))
                .collect(),
            metrics: self.metrics.snapshot(),
        };
        let objects_path = output_dir.join("objects.json");
        write_json_atomic(&objects_path, &serde_json::to_vec(&objects)?)?;
        write_json_atomic(&output_dir.join("report.json"), &serde_json::to_vec_pretty(&report)?)?;

        info!(
            "Merged {} objects from {} chunks ({} failed) into {}",
            objects.result.object_count,
            objects.result.chunks_merged,
            objects.result.gaps.len(),
            objects_path.display()
        );
        let message = format!(
            "{} objects, {} of {} chunks merged",
            objects.result.object_count, objects.result.chunks_merged, total
        );
        Ok(StageOutcome::Completed(StageSummary {
            artifact: Some(objects_path.display().to_string()),
            message: Some(message),
            gaps: objects.result.gaps,
            object_count: Some(objects.result.object_count),
        }))
    }

    async fn upload(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let remote = self
            .config
            .remote
            .as_ref()
            .ok_or_else(|| PipelineError::config("upload stage enabled without a remote section"))?;
        let store = match &self.output_store {
            Some(store) => Arc::clone(store),
            None => create_output_store(remote)?,
        };
        let include = glob::Pattern::new(&remote.include_pattern)
            .map_err(|e| PipelineError::config(format!("remote.include_pattern: {}", e)))?;

        let client = RemoteStagingClient::new(store, self.config.retry.clone())
            .with_cancellation(ctx.cancel.clone());
        let summary = client
            .upload(&self.work_path("output"), &output_prefix(remote), &include)
            .await?;
        Ok(StageOutcome::Completed(StageSummary {
            artifact: Some(remote.path_display()),
            message: Some(format!(
                "{} files uploaded, {} already present",
                summary.uploaded, summary.skipped
            )),
            ..StageSummary::default()
        }))
    }
}

impl StageExecutor for DefaultStageExecutor {
    fn execute<'a>(&'a self, stage: Stage, ctx: &'a StageContext) -> BoxFuture<'a, Result<StageOutcome>> {
        Box::pin(async move {
            match stage {
                Stage::StitchAlign => self.stitch_align(ctx).await,
                Stage::StitchFuse => self.stitch_fuse(ctx).await,
                Stage::Import => self.import(ctx).await,
                Stage::Transpose => self.transpose(ctx).await,
                Stage::Process => self.process(ctx).await,
                Stage::Upload => self.upload(ctx).await,
            }
        })
    }

    fn restore(&self, stage: Stage, entry: &LedgerEntry) -> Result<Option<StageSummary>> {
        if stage != Stage::Process {
            return Ok(None);
        }
        let Some(artifact) = &entry.artifact else {
            return Ok(None);
        };
        let objects = ObjectsFile::load(Path::new(artifact))?;
        Ok(Some(StageSummary {
            artifact: Some(artifact.clone()),
            message: entry.message.clone(),
            object_count: Some(objects.result.object_count),
            gaps: objects.result.gaps,
        }))
    }
}

fn completed(artifact: &Path, message: String) -> StageOutcome {
    StageOutcome::Completed(StageSummary {
        artifact: Some(artifact.display().to_string()),
        message: Some(message),
        ..StageSummary::default()
    })
}

/// Run synchronous stage work on the blocking pool.
async fn blocking<T, F>(stage: Stage, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PipelineError::stage_fatal(stage.name(), format!("task failed: {}", e)))?
}

fn write_json_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Validate a local volume and apply metadata overrides. Returns the sidecar
/// of the volume later stages read; overrides are written to a new sidecar
/// in `import_dir`, never to the source.
fn import_volume(
    source: &Path,
    input: &InputConfig,
    import_dir: &Path,
) -> Result<(PathBuf, VolumeInfo)> {
    let volume = RawVolume::open(source)?;
    let mut info = volume.info().clone();

    if let Some(channel) = input.channel {
        if channel >= info.shape.channels {
            return Err(PipelineError::config(format!(
                "input.channel {} is not in a volume with {} channel(s)",
                channel, info.shape.channels
            )));
        }
    }

    let mut overridden = false;
    if let Some(resolution) = input.resolution {
        info.resolution = resolution;
        overridden = true;
    }
    if input.magnification.is_some() {
        info.magnification = input.magnification;
        overridden = true;
    }
    if input.zoom.is_some() {
        info.zoom = input.zoom;
        overridden = true;
    }

    let (source_sidecar, _) = volume_paths(source);
    if !overridden {
        return Ok((source_sidecar, info));
    }
    info.validate()?;

    let name = source_sidecar
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "volume".to_string());
    let (sidecar, data) = volume_paths(&import_dir.join(name));
    if data != volume.data_path() {
        link_or_copy(volume.data_path(), &data)?;
    }
    write_json_atomic(&sidecar, &serde_json::to_vec_pretty(&info)?)?;
    debug!("Wrote metadata overrides to {}", sidecar.display());
    Ok((sidecar, info))
}

fn link_or_copy(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if to.exists() {
        std::fs::remove_file(to)?;
    }
    if std::fs::hard_link(from, to).is_err() {
        std::fs::copy(from, to)?;
    }
    Ok(())
}

/// Source index sampled for output index `i` when scaling by `scale`.
fn sample(i: usize, scale: f64, len: usize) -> usize {
    ((i as f64 / scale).floor() as usize).min(len - 1)
}

/// Write `source` re-oriented to `plane` and rescaled by `scale` (nearest
/// neighbour), one output plane at a time.
fn transpose_volume(
    source: &Path,
    target: &Path,
    plane: Plane,
    scale: f64,
    cancel: &CancellationToken,
) -> Result<VolumeInfo> {
    let volume = RawVolume::open(source)?;
    let info = volume.info();
    if info.plane != Plane::Xy && plane != Plane::Xy {
        return Err(PipelineError::config(format!(
            "volume is already in {:?} orientation",
            info.plane
        )));
    }

    let axes = plane.source_axes();
    let src = info.shape.dims;
    let channels = info.shape.channels;
    let out_dims: [usize; 3] =
        std::array::from_fn(|i| ((src[axes[i].index()] as f64 * scale).round() as usize).max(1));

    let mut out = info.clone();
    out.shape = VolumeShape::new(out_dims, channels);
    out.resolution = std::array::from_fn(|i| info.resolution[axes[i].index()] / scale);
    out.plane = plane;
    out.scaling = Some(match info.scaling {
        Some(s) => std::array::from_fn(|i| s[axes[i].index()] * scale),
        None => [scale; 3],
    });

    // Position of a source axis inside a slab with the slicing axis removed.
    let slab_pos = |axis: usize| if axis < axes[0].index() { axis } else { axis - 1 };
    let (p1, p2) = (slab_pos(axes[1].index()), slab_pos(axes[2].index()));
    let (len1, len2) = (src[axes[1].index()], src[axes[2].index()]);

    let mut writer = RawVolumeWriter::create(target, out.clone())?;
    let mut cached: Option<(usize, Array3<u16>)> = None;
    for k in 0..out_dims[0] {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(format!(
                "transpose after {} of {} planes",
                k, out_dims[0]
            )));
        }
        let s = sample(k, scale, src[axes[0].index()]);
        if cached.as_ref().map(|(index, _)| *index) != Some(s) {
            let region = info.shape.full_box().with_axis(axes[0], s, s + 1);
            let slab = volume
                .read_region(&region)?
                .index_axis_move(ndarray::Axis(axes[0].index()), 0);
            cached = Some((s, slab));
        }
        let Some((_, slab)) = &cached else {
            continue;
        };

        let plane_data = Array3::from_shape_fn((out_dims[1], out_dims[2], channels), |(j, i, c)| {
            let mut at = [0usize; 2];
            at[p1] = sample(j, scale, len1);
            at[p2] = sample(i, scale, len2);
            slab[[at[0], at[1], c]]
        });
        writer.write_plane(&plane_data)?;
    }
    let written = writer.finish()?;
    info!(
        "Transposed {} -> {} ({} in {:?} orientation)",
        source.display(),
        target.display(),
        out_dims
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x"),
        plane
    );
    Ok(written.info().clone())
}
