//! Bounded-concurrency chunk executor.
//!
//! Every chunk needs a worker slot and admission tokens proportional to the
//! estimated working memory of its outer box before it runs. Analysis runs on
//! the blocking thread pool. A failing chunk is retried with the same region
//! up to the configured limit, then recorded as failed; other chunks are never
//! blocked by it.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::io::{EntryStatus, JobLedger};
use crate::pipeline::analyzer::{ChunkAnalyzer, Detection};
use crate::pipeline::Metrics;
use crate::plan::{ChunkPlanner, ChunkRegion};
use crate::volume::VolumeSource;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bytes represented by one admission token.
const TOKEN_BYTES: u64 = 1024;

/// Outcome of one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    pub region: ChunkRegion,

    /// `Succeeded` or `Failed` once the chunk ran; `Pending` if it never
    /// completed because the pool was cancelled
    pub status: EntryStatus,

    /// Attempts made
    pub attempts: u32,

    /// Objects found in the outer box, in chunk-local coordinates
    #[serde(default)]
    pub detections: Vec<Detection>,

    #[serde(default)]
    pub error: Option<String>,
}

impl ChunkResult {
    pub fn is_succeeded(&self) -> bool {
        self.status.is_succeeded()
    }

    fn not_run(region: ChunkRegion, attempts: u32, reason: &str) -> Self {
        Self {
            region,
            status: EntryStatus::Pending,
            attempts,
            detections: Vec::new(),
            error: Some(reason.to_string()),
        }
    }
}

/// Per-chunk result files, `chunk_NNNNN.json` in one directory.
#[derive(Debug, Clone)]
pub struct ChunkArtifacts {
    dir: PathBuf,
}

impl ChunkArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, index: usize) -> PathBuf {
        self.dir.join(format!("chunk_{:05}.json", index))
    }

    /// Write a result atomically and return its path.
    pub fn save(&self, result: &ChunkResult) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(result.region.index);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(result)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<ChunkResult> {
        let bytes = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::NotFound(path.display().to_string()),
            _ => PipelineError::Io(e),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum concurrently running chunks
    pub workers: usize,

    /// Retries after a chunk's first failure
    pub retries: usize,

    /// Memory the pool may commit to running chunks, in bytes
    pub memory_budget: u64,

    /// Estimated working memory per outer-box voxel, all channels included
    pub bytes_per_voxel: f64,

    /// How long in-flight chunks may keep running after cancellation
    pub cancel_grace: Duration,

    /// Where succeeded chunk results are written
    pub artifacts: Option<ChunkArtifacts>,
}

impl PoolSettings {
    pub fn from_config(config: &Config, planner: &ChunkPlanner, channels: usize) -> Self {
        Self {
            workers: config.processing.worker_limit(),
            retries: config.processing.chunk_retries,
            memory_budget: planner.memory_budget(),
            bytes_per_voxel: config.chunking.bytes_per_voxel_cost * channels as f64,
            cancel_grace: Duration::from_secs(config.processing.cancel_grace_secs),
            artifacts: Some(ChunkArtifacts::new(config.work_dir.join("chunks"))),
        }
    }
}

enum Attempt {
    Done(Vec<Detection>),
    Failed(String),
    Abandoned,
}

/// Executes chunk analyses under a worker and memory budget.
pub struct WorkerPool {
    source: Arc<dyn VolumeSource>,
    analyzer: Arc<dyn ChunkAnalyzer>,
    ledger: Arc<JobLedger>,
    metrics: Arc<Metrics>,
    settings: PoolSettings,
    slots: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    total_tokens: u32,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        source: Arc<dyn VolumeSource>,
        analyzer: Arc<dyn ChunkAnalyzer>,
        ledger: Arc<JobLedger>,
        metrics: Arc<Metrics>,
        settings: PoolSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        let total_tokens = (settings.memory_budget / TOKEN_BYTES).clamp(1, u32::MAX as u64) as u32;
        debug!(
            "Worker pool: {} workers, {} admission tokens of {} bytes",
            workers, total_tokens, TOKEN_BYTES
        );
        Self {
            source,
            analyzer,
            ledger,
            metrics,
            slots: Arc::new(Semaphore::new(workers)),
            admission: Arc::new(Semaphore::new(total_tokens as usize)),
            total_tokens,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the pool to an outer cancellation token. Cancelling the pool
    /// itself does not cancel `parent`.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Admission tokens a chunk needs. A chunk larger than the whole budget
    /// takes the whole budget and therefore runs alone.
    pub fn tokens_for(&self, region: &ChunkRegion) -> u32 {
        let bytes = region.outer_voxels() as f64 * self.settings.bytes_per_voxel;
        let tokens = (bytes / TOKEN_BYTES as f64).ceil() as u64;
        tokens.clamp(1, self.total_tokens as u64) as u32
    }

    pub fn total_tokens(&self) -> u32 {
        self.total_tokens
    }

    /// Stop dispatching. In-flight chunks get the grace period to finish.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!("Cancelling worker pool");
            self.cancel.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one chunk once a worker slot and its admission tokens are free.
    pub async fn submit(&self, region: ChunkRegion) -> ChunkResult {
        let tokens = self.tokens_for(&region);
        let acquire = async {
            let slot = self.slots.clone().acquire_owned().await?;
            let admitted = self.admission.clone().acquire_many_owned(tokens).await?;
            Ok::<_, tokio::sync::AcquireError>((slot, admitted))
        };

        let permits = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permits = acquire => permits.ok(),
        };
        let Some(_permits) = permits else {
            debug!("Chunk {} not dispatched: pool cancelled", region.index);
            self.metrics.add_chunk_cancelled();
            return ChunkResult::not_run(region, 0, "cancelled before dispatch");
        };

        self.execute(region).await
    }

    /// Run all regions; results arrive in completion order. The returned
    /// receiver is a `Stream` and ends once every region has a result.
    pub fn run(self: &Arc<Self>, regions: Vec<ChunkRegion>) -> async_channel::Receiver<ChunkResult> {
        let workers = self.settings.workers.max(1);
        let (work_tx, work_rx) = async_channel::bounded::<ChunkRegion>(regions.len().max(1));
        for region in regions {
            let _ = work_tx.try_send(region);
        }
        work_tx.close();

        let (result_tx, result_rx) = async_channel::bounded::<ChunkResult>(workers);
        for _ in 0..workers {
            let pool = Arc::clone(self);
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                while let Ok(region) = work_rx.recv().await {
                    let result = pool.submit(region).await;
                    if result_tx.send(result).await.is_err() {
                        debug!("Result receiver dropped, stopping worker");
                        break;
                    }
                }
            });
        }
        result_rx
    }

    async fn execute(&self, region: ChunkRegion) -> ChunkResult {
        let index = region.index;
        let max_attempts = self.settings.retries as u32 + 1;
        let mut attempts = 0;
        let mut last_error = String::new();

        while attempts < max_attempts {
            attempts += 1;
            self.record(index, self.ledger.chunk_started(index));
            self.metrics.chunk_started();
            let outcome = self.attempt(&region).await;
            self.metrics.chunk_finished();

            last_error = match outcome {
                Attempt::Done(detections) => match self.persist(region, attempts, detections) {
                    Ok(result) => return result,
                    Err(e) => format!("could not persist result: {}", e),
                },
                Attempt::Failed(message) => message,
                Attempt::Abandoned => {
                    warn!("Chunk {} abandoned after cancellation grace period", index);
                    return ChunkResult::not_run(region, attempts, "abandoned after cancellation");
                }
            };

            if attempts >= max_attempts || self.cancel.is_cancelled() {
                break;
            }
            warn!(
                "Chunk {} attempt {}/{} failed, retrying: {}",
                index, attempts, max_attempts, last_error
            );
            self.metrics.add_chunk_retry();
            self.record(index, self.ledger.chunk_retried(index, &last_error));
        }

        let err = PipelineError::ChunkAnalysis {
            chunk: index,
            message: last_error,
        };
        warn!("{}", err);
        self.metrics.add_chunk_failed();
        self.record(index, self.ledger.chunk_failed(index, &err.to_string()));
        ChunkResult {
            region,
            status: EntryStatus::Failed,
            attempts,
            detections: Vec::new(),
            error: Some(err.to_string()),
        }
    }

    async fn attempt(&self, region: &ChunkRegion) -> Attempt {
        let source = Arc::clone(&self.source);
        let analyzer = Arc::clone(&self.analyzer);
        let metrics = Arc::clone(&self.metrics);
        let region = *region;

        let handle = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Detection>> {
            let read_start = Instant::now();
            let data = source.read_region(&region.outer)?;
            metrics.add_read_time(read_start.elapsed());
            metrics.add_bytes_read((data.len() * std::mem::size_of::<u16>()) as u64);
            metrics.add_voxels_analyzed(region.outer_voxels());

            let analyze_start = Instant::now();
            let detections = analyzer.analyze(&region, data.view())?;
            metrics.add_analyze_time(analyze_start.elapsed());
            metrics.add_objects_detected(detections.len() as u64);
            Ok(detections)
        });

        let grace = self.settings.cancel_grace;
        let cancel = self.cancel.clone();
        tokio::select! {
            joined = handle => match joined {
                Ok(Ok(detections)) => Attempt::Done(detections),
                Ok(Err(e)) => Attempt::Failed(format!("{:#}", e)),
                Err(e) => Attempt::Failed(format!("analysis task failed: {}", e)),
            },
            _ = async move {
                cancel.cancelled().await;
                tokio::time::sleep(grace).await;
            } => Attempt::Abandoned,
        }
    }

    fn persist(&self, region: ChunkRegion, attempts: u32, detections: Vec<Detection>) -> Result<ChunkResult> {
        let result = ChunkResult {
            region,
            status: EntryStatus::Succeeded,
            attempts,
            detections,
            error: None,
        };
        let start = Instant::now();
        let artifact = match &self.settings.artifacts {
            Some(artifacts) => Some(artifacts.save(&result)?.display().to_string()),
            None => None,
        };
        self.metrics.add_persist_time(start.elapsed());
        self.metrics.add_chunk_succeeded();
        self.record(region.index, self.ledger.chunk_succeeded(region.index, artifact));
        debug!(
            "Chunk {} succeeded with {} objects after {} attempt(s)",
            region.index,
            result.detections.len(),
            attempts
        );
        Ok(result)
    }

    fn record(&self, index: usize, outcome: Result<()>) {
        if let Err(e) = outcome {
            warn!("Failed to update ledger for chunk {}: {}", index, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analyzer::DetectionFlag;
    use crate::plan::{ChunkPlan, ChunkTarget};
    use crate::volume::{Axis, MemoryVolume, VolumeShape};
    use futures::StreamExt;
    use ndarray::{Array4, ArrayView4};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Reports one object at the centre of every chunk and records how many
    /// analyses run at once.
    #[derive(Default)]
    struct InstrumentedAnalyzer {
        delay_ms: u64,
        fail_always: HashSet<usize>,
        fail_once: Mutex<HashSet<usize>>,
        panic_on: Option<usize>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl ChunkAnalyzer for InstrumentedAnalyzer {
        fn name(&self) -> &str {
            "instrumented"
        }

        fn max_object_radius(&self) -> f64 {
            1.0
        }

        fn analyze(&self, region: &ChunkRegion, data: ArrayView4<'_, u16>) -> anyhow::Result<Vec<Detection>> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on == Some(region.index) {
                panic!("analyzer crashed");
            }
            if self.fail_always.contains(&region.index) {
                anyhow::bail!("segmentation diverged");
            }
            if self.fail_once.lock().unwrap().remove(&region.index) {
                anyhow::bail!("transient glitch");
            }
            let s = data.shape();
            let c = [s[0] as f64 / 2.0, s[1] as f64 / 2.0, s[2] as f64 / 2.0];
            Ok(vec![Detection {
                centroid: c,
                bounds_min: c,
                bounds_max: c,
                radius: 1.0,
                confidence: 1.0,
                flag: DetectionFlag::Unverified,
                channel: 0,
            }])
        }
    }

    fn plan(chunks: usize) -> ChunkPlan {
        ChunkPlanner::new(1)
            .with_axis(Axis::X)
            .with_target(ChunkTarget::Size(10))
            .plan(VolumeShape::new([4, 4, chunks * 10], 1), 2)
            .unwrap()
    }

    fn settings(workers: usize, memory_budget: u64) -> PoolSettings {
        PoolSettings {
            workers,
            retries: 1,
            memory_budget,
            bytes_per_voxel: TOKEN_BYTES as f64,
            cancel_grace: Duration::from_secs(5),
            artifacts: None,
        }
    }

    fn pool(
        plan: &ChunkPlan,
        analyzer: Arc<InstrumentedAnalyzer>,
        ledger: Arc<JobLedger>,
        settings: PoolSettings,
    ) -> Arc<WorkerPool> {
        let dims = plan.shape().dims;
        let source = Arc::new(MemoryVolume {
            data: Array4::zeros((dims[0], dims[1], dims[2], 1)),
        });
        Arc::new(WorkerPool::new(source, analyzer, ledger, Metrics::new(), settings))
    }

    async fn collect(rx: async_channel::Receiver<ChunkResult>) -> Vec<ChunkResult> {
        let mut results: Vec<ChunkResult> = rx.collect().await;
        results.sort_by_key(|r| r.region.index);
        results
    }

    #[tokio::test]
    async fn test_all_chunks_complete_and_persist() {
        let dir = TempDir::new().unwrap();
        let plan = plan(4);
        let ledger = Arc::new(JobLedger::in_memory());
        let mut settings = settings(2, u64::MAX);
        settings.artifacts = Some(ChunkArtifacts::new(dir.path().join("chunks")));
        let pool = pool(&plan, Arc::new(InstrumentedAnalyzer::default()), ledger.clone(), settings);

        let results = collect(pool.run(plan.regions().to_vec())).await;

        assert_eq!(results.len(), 4);
        for result in &results {
            assert!(result.is_succeeded());
            assert_eq!(result.attempts, 1);
            assert_eq!(result.detections.len(), 1);
            let entry = ledger.chunk(result.region.index).unwrap();
            assert_eq!(entry.status, EntryStatus::Succeeded);
            let artifact = entry.artifact.unwrap();
            let loaded = ChunkArtifacts::load(Path::new(&artifact)).unwrap();
            assert_eq!(loaded.region, result.region);
            assert_eq!(loaded.detections, result.detections);
        }
        assert_eq!(pool.metrics.snapshot().chunks_succeeded, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_admission_limits_concurrency_to_budget() {
        // Interior outer boxes are 12 x 4 x 4 voxels; one token per voxel.
        let plan = plan(10);
        let standard = plan.regions()[1].outer_voxels();
        let analyzer = Arc::new(InstrumentedAnalyzer {
            delay_ms: 30,
            ..Default::default()
        });
        let budget = 3 * standard * TOKEN_BYTES;
        let pool = pool(&plan, analyzer.clone(), Arc::new(JobLedger::in_memory()), settings(10, budget));
        assert_eq!(pool.tokens_for(&plan.regions()[1]) as u64, standard);

        let results = collect(pool.run(plan.regions().to_vec())).await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.is_succeeded()));
        let max = analyzer.max_running.load(Ordering::SeqCst);
        assert!(max <= 3, "{} chunks ran concurrently", max);
        assert!(pool.metrics.snapshot().peak_running_chunks <= 3);
    }

    #[tokio::test]
    async fn test_oversized_chunk_takes_whole_budget() {
        let plan = plan(2);
        let pool = pool(&plan, Arc::new(InstrumentedAnalyzer::default()), Arc::new(JobLedger::in_memory()), settings(2, 4 * TOKEN_BYTES));
        assert_eq!(pool.total_tokens(), 4);
        assert_eq!(pool.tokens_for(&plan.regions()[0]), 4);

        let results = collect(pool.run(plan.regions().to_vec())).await;
        assert!(results.iter().all(|r| r.is_succeeded()));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_contained() {
        let plan = plan(5);
        let analyzer = Arc::new(InstrumentedAnalyzer {
            fail_always: [2].into_iter().collect(),
            ..Default::default()
        });
        let ledger = Arc::new(JobLedger::in_memory());
        let pool = pool(&plan, analyzer, ledger.clone(), settings(3, u64::MAX));

        let results = collect(pool.run(plan.regions().to_vec())).await;

        assert_eq!(results.len(), 5);
        let failed: Vec<_> = results.iter().filter(|r| !r.is_succeeded()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].region.index, 2);
        assert_eq!(failed[0].status, EntryStatus::Failed);
        assert_eq!(failed[0].attempts, 2);
        assert!(failed[0].error.as_deref().unwrap().contains("segmentation diverged"));

        let entry = ledger.chunk(2).unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.attempts, 2);
        let snapshot = pool.metrics.snapshot();
        assert_eq!(snapshot.chunks_failed, 1);
        assert_eq!(snapshot.chunk_retries, 1);
        assert_eq!(snapshot.chunks_succeeded, 4);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_with_same_region() {
        let plan = plan(3);
        let analyzer = Arc::new(InstrumentedAnalyzer {
            fail_once: Mutex::new([1].into_iter().collect()),
            ..Default::default()
        });
        let pool = pool(&plan, analyzer, Arc::new(JobLedger::in_memory()), settings(1, u64::MAX));

        let result = pool.submit(plan.regions()[1]).await;
        assert!(result.is_succeeded());
        assert_eq!(result.attempts, 2);
        assert_eq!(result.region, plan.regions()[1]);
    }

    #[tokio::test]
    async fn test_panicking_analyzer_fails_chunk_only() {
        let plan = plan(3);
        let analyzer = Arc::new(InstrumentedAnalyzer {
            panic_on: Some(0),
            ..Default::default()
        });
        let pool = pool(&plan, analyzer, Arc::new(JobLedger::in_memory()), settings(2, u64::MAX));

        let results = collect(pool.run(plan.regions().to_vec())).await;
        assert_eq!(results[0].status, EntryStatus::Failed);
        assert!(results[1].is_succeeded());
        assert!(results[2].is_succeeded());
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let plan = plan(4);
        let pool = pool(&plan, Arc::new(InstrumentedAnalyzer::default()), Arc::new(JobLedger::in_memory()), settings(2, u64::MAX));
        pool.cancel();

        let results = collect(pool.run(plan.regions().to_vec())).await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.status == EntryStatus::Pending && r.attempts == 0));
        assert_eq!(pool.metrics.snapshot().chunks_cancelled, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_in_flight_chunk_abandoned_after_grace() {
        let plan = plan(1);
        let analyzer = Arc::new(InstrumentedAnalyzer {
            delay_ms: 2000,
            ..Default::default()
        });
        let mut settings = settings(1, u64::MAX);
        settings.cancel_grace = Duration::from_millis(20);
        let pool = pool(&plan, analyzer, Arc::new(JobLedger::in_memory()), settings);

        let region = plan.regions()[0];
        let running = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(region).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.cancel();

        let result = running.await.unwrap();
        assert_eq!(result.status, EntryStatus::Pending);
        assert_eq!(result.error.as_deref(), Some("abandoned after cancellation"));
    }

    #[test]
    fn test_missing_artifact_is_not_found() {
        let dir = TempDir::new().unwrap();
        let artifacts = ChunkArtifacts::new(dir.path());
        assert!(artifacts.path_for(7).ends_with("chunk_00007.json"));
        assert!(matches!(
            ChunkArtifacts::load(&artifacts.path_for(7)),
            Err(PipelineError::NotFound(_))
        ));
    }
}
