//! Pipeline orchestration: chunk analysis, the worker pool, seam merging and
//! stage sequencing.

mod analyzer;
mod coordinator;
mod merger;
mod metrics;
mod stages;
mod worker_pool;


pub use analyzer::{build_analyzer, ChunkAnalyzer, Detection, DetectionFlag, PeakDetector};
pub use coordinator::{
    PipelineCoordinator, PipelineReport, RunStatus, Stage, StageContext, StageExecutor,
    StageOutcome, StageReport, StageSummary, ALIGNMENT_VERIFIED,
};
pub use merger::{ChunkGap, SeamMerger, WholeVolumeResult};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use stages::{DefaultStageExecutor, ObjectsFile};
pub use worker_pool::{ChunkArtifacts, ChunkResult, PoolSettings, WorkerPool};
