//! Stage sequencing.
//!
//! Stages run strictly in order: stitch-align, stitch-fuse, import, transpose,
//! process, upload. Each stage moves `pending -> running -> succeeded | failed`
//! in the [`JobLedger`]; a retryable failure with attempts left re-enters
//! `pending` and runs again after a backoff. Stages that are not enabled are
//! recorded as skipped and count as succeeded. A stage that completes with
//! gaps is recorded as partial: later stages still run, but a restart enters
//! it again. On restart, stages the ledger records as succeeded are not run
//! again and their artifacts are trusted, up to the first stage that has to
//! run; everything after that runs again on top of the new output.
//!
//! Cancellation reaches a running stage only through its context token. The
//! coordinator waits for the stage to wind down, so nothing it started is
//! still writing to the ledger once [`PipelineCoordinator::run`] returns.

use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::io::{deliver, EntryStatus, JobLedger, LedgerEntry, NotificationSink, StageEvent};
use crate::pipeline::merger::ChunkGap;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Signal an operator records once the stitch alignment has been checked.
pub const ALIGNMENT_VERIFIED: &str = "alignment-verified";

/// A pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    StitchAlign,
    StitchFuse,
    Import,
    Transpose,
    Process,
    Upload,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 6] = [
        Stage::StitchAlign,
        Stage::StitchFuse,
        Stage::Import,
        Stage::Transpose,
        Stage::Process,
        Stage::Upload,
    ];

    /// Ledger key.
    pub fn name(self) -> &'static str {
        match self {
            Stage::StitchAlign => "stitch-align",
            Stage::StitchFuse => "stitch-fuse",
            Stage::Import => "import",
            Stage::Transpose => "transpose",
            Stage::Process => "process",
            Stage::Upload => "upload",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.name() == name)
    }

    pub fn is_enabled(self, config: &Config) -> bool {
        let stages = &config.stages;
        match self {
            Stage::StitchAlign | Stage::StitchFuse => stages.stitch && config.stitch.is_some(),
            Stage::Import => stages.import,
            Stage::Transpose => stages.transpose,
            Stage::Process => stages.process,
            Stage::Upload => stages.upload,
        }
    }

    /// This stage and every stage after it.
    pub fn and_after(self) -> &'static [Stage] {
        let position = Stage::ALL.iter().position(|&s| s == self).unwrap_or(0);
        &Stage::ALL[position..]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a completed stage produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    /// Reference to the stage's output, stored in the ledger
    pub artifact: Option<String>,
    pub message: Option<String>,
    /// Chunks that contributed nothing
    pub gaps: Vec<ChunkGap>,
    pub object_count: Option<usize>,
}

/// Result of one stage attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(StageSummary),
    /// The stage cannot start until an external signal is recorded.
    AwaitingSignal { signal: String, message: String },
}

/// Shared state handed to each stage attempt.
#[derive(Clone)]
pub struct StageContext {
    pub ledger: Arc<JobLedger>,
    pub cancel: CancellationToken,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Runs individual stages.
pub trait StageExecutor: Send + Sync {
    fn execute<'a>(&'a self, stage: Stage, ctx: &'a StageContext) -> BoxFuture<'a, Result<StageOutcome>>;

    /// Rebuild the summary of a stage that succeeded in an earlier run.
    fn restore(&self, _stage: Stage, _entry: &LedgerEntry) -> Result<Option<StageSummary>> {
        Ok(None)
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithPartialFailures,
    AwaitingSignal,
    Halted,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithPartialFailures => "completed with partial failures",
            RunStatus::AwaitingSignal => "awaiting signal",
            RunStatus::Halted => "halted",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal status of one stage in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: EntryStatus,
    pub attempts: u32,
    /// Succeeded in an earlier run and not executed again
    pub resumed: bool,
    pub artifact: Option<String>,
    pub message: Option<String>,
}

/// Final report of a coordinator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub status: RunStatus,
    pub stages: Vec<StageReport>,
    /// Chunks that failed or never ran
    pub failed_regions: Vec<ChunkGap>,
    pub object_count: Option<usize>,
    /// Stage a rerun would start from
    pub resume_from: Option<Stage>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Completed | RunStatus::CompletedWithPartialFailures
        )
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline {}", self.status)?;
        for stage in &self.stages {
            write!(f, "  {:<13} {:<10}", stage.stage.name(), stage.status.to_string())?;
            if stage.resumed {
                write!(f, " (from previous run)")?;
            } else if stage.attempts > 1 {
                write!(f, " ({} attempts)", stage.attempts)?;
            }
            if let Some(message) = &stage.message {
                write!(f, " {}", message)?;
            }
            writeln!(f)?;
        }
        if let Some(count) = self.object_count {
            writeln!(f, "  Objects: {}", count)?;
        }
        if !self.failed_regions.is_empty() {
            writeln!(f, "  Failed regions:")?;
            for gap in &self.failed_regions {
                writeln!(f, "    chunk {} {}: {}", gap.region.index, gap.region.inner, gap.reason)?;
            }
        }
        if let Some(stage) = self.resume_from {
            writeln!(f, "  Resume from: {}", stage)?;
        }
        Ok(())
    }
}

/// Sequences the stages of one job.
pub struct PipelineCoordinator {
    config: Arc<Config>,
    ledger: Arc<JobLedger>,
    executor: Arc<dyn StageExecutor>,
    sink: Arc<dyn NotificationSink>,
    notify_timeout: Duration,
    cancel: CancellationToken,
}

impl PipelineCoordinator {
    pub fn new(
        config: Arc<Config>,
        ledger: Arc<JobLedger>,
        executor: Arc<dyn StageExecutor>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let notify_timeout = Duration::from_secs(
            config.notify.as_ref().map_or(10, |n| n.timeout_secs).max(1),
        );
        Self {
            config,
            ledger,
            executor,
            sink,
            notify_timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// First enabled stage the ledger does not record as succeeded.
    pub fn resume_point(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|&stage| {
            stage.is_enabled(&self.config) && !self.ledger.stage_status(stage.name()).is_succeeded()
        })
    }

    /// Run every remaining stage. Stage failures are reported, not returned;
    /// an error means the ledger itself could not be updated.
    pub async fn run(&self) -> Result<PipelineReport> {
        let started_at = Utc::now();
        let mut stages = Vec::new();
        let mut failed_regions = Vec::new();
        let mut object_count = None;
        let mut status = RunStatus::Completed;
        let mut resume_from = None;

        if let Some(stage) = self.resume_point() {
            if stage != Stage::ALL[0] {
                info!("Resuming job at stage '{}'", stage);
            }
        }

        let mut executed_earlier = false;
        for stage in Stage::ALL {
            let name = stage.name();

            if !stage.is_enabled(&self.config) {
                if !self.ledger.stage_status(name).is_succeeded() {
                    self.ledger.stage_skipped(name)?;
                }
                stages.push(self.stage_report(stage, false));
                continue;
            }

            let trusted = self
                .ledger
                .stage(name)
                .filter(|e| e.status.is_succeeded() && !executed_earlier);
            if let Some(entry) = trusted {
                info!("Stage '{}' already succeeded, skipping", name);
                match self.executor.restore(stage, &entry) {
                    Ok(Some(summary)) => {
                        failed_regions.extend(summary.gaps);
                        object_count = summary.object_count.or(object_count);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Could not restore summary of stage '{}': {}", name, e),
                }
                stages.push(self.stage_report(stage, true));
                continue;
            }

            if self.cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                resume_from = Some(stage);
                break;
            }

            executed_earlier = true;
            match self.run_stage(stage).await? {
                Ok(StageOutcome::Completed(summary)) => {
                    failed_regions.extend(summary.gaps);
                    object_count = summary.object_count.or(object_count);
                    stages.push(self.stage_report(stage, false));
                }
                Ok(StageOutcome::AwaitingSignal { signal, message }) => {
                    info!("Stage '{}' is waiting for signal '{}': {}", name, signal, message);
                    stages.push(self.stage_report(stage, false));
                    status = RunStatus::AwaitingSignal;
                    resume_from = Some(stage);
                    break;
                }
                Err(PipelineError::Cancelled(what)) => {
                    warn!("Stage '{}' cancelled: {}", name, what);
                    stages.push(self.stage_report(stage, false));
                    status = RunStatus::Cancelled;
                    resume_from = Some(stage);
                    break;
                }
                Err(e) => {
                    error!("Stage '{}' failed, halting: {}", name, e);
                    stages.push(self.stage_report(stage, false));
                    status = RunStatus::Halted;
                    resume_from = Some(stage);
                    break;
                }
            }
        }

        if status == RunStatus::Completed && !failed_regions.is_empty() {
            status = RunStatus::CompletedWithPartialFailures;
            resume_from = self.resume_point();
        }

        let report = PipelineReport {
            status,
            stages,
            failed_regions,
            object_count,
            resume_from,
            started_at,
            finished_at: Utc::now(),
        };
        info!("Pipeline {}", report.status);
        Ok(report)
    }

    /// Run one stage with retries. The outer result fails only on ledger
    /// errors; the inner result is the stage's own outcome.
    async fn run_stage(&self, stage: Stage) -> Result<Result<StageOutcome>> {
        let name = stage.name();
        let retry = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.ledger.stage_started(name)?;
            self.notify(stage, EntryStatus::Running, None).await;
            info!("Stage '{}' started (attempt {})", name, attempt);

            let ctx = StageContext {
                ledger: Arc::clone(&self.ledger),
                cancel: self.cancel.clone(),
                attempt,
            };
            // Not raced against the token: the stage observes `ctx.cancel`
            // and returns once its in-flight work has finished or been
            // abandoned.
            let outcome = self.executor.execute(stage, &ctx).await;

            match outcome {
                Ok(StageOutcome::Completed(summary)) if !summary.gaps.is_empty() => {
                    let message = summary.message.clone().unwrap_or_else(|| {
                        format!("{} failed region(s)", summary.gaps.len())
                    });
                    self.ledger
                        .stage_partial(name, summary.artifact.clone(), &message)?;
                    self.notify(stage, EntryStatus::Partial, Some(message)).await;
                    warn!(
                        "Stage '{}' finished with {} failed region(s)",
                        name,
                        summary.gaps.len()
                    );
                    return Ok(Ok(StageOutcome::Completed(summary)));
                }
                Ok(StageOutcome::Completed(summary)) => {
                    self.ledger.stage_succeeded(name, summary.artifact.clone())?;
                    self.notify(stage, EntryStatus::Succeeded, summary.message.clone()).await;
                    info!("Stage '{}' succeeded", name);
                    return Ok(Ok(StageOutcome::Completed(summary)));
                }
                Ok(StageOutcome::AwaitingSignal { signal, message }) => {
                    self.ledger.stage_waiting(name, &message)?;
                    self.notify(stage, EntryStatus::Pending, Some(message.clone())).await;
                    return Ok(Ok(StageOutcome::AwaitingSignal { signal, message }));
                }
                Err(PipelineError::Cancelled(what)) => {
                    self.ledger.stage_failed(name, "cancelled", true)?;
                    return Ok(Err(PipelineError::Cancelled(what)));
                }
                Err(e) if e.is_retryable() && (attempt as usize) <= retry.max_retries => {
                    let backoff = retry.backoff(attempt as usize);
                    warn!(
                        "Stage '{}' attempt {} failed, retrying in {:?}: {}",
                        name, attempt, backoff, e
                    );
                    self.ledger.stage_failed(name, &e.to_string(), true)?;
                    self.notify(stage, EntryStatus::Retried, Some(e.to_string())).await;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Ok(Err(PipelineError::Cancelled(name.to_string())));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    let fatal = match e {
                        PipelineError::StageFatal { .. } => e,
                        other => PipelineError::stage_fatal(name, other.to_string()),
                    };
                    self.ledger.stage_failed(name, &fatal.to_string(), false)?;
                    self.notify(stage, EntryStatus::Failed, Some(fatal.to_string())).await;
                    return Ok(Err(fatal));
                }
            }
        }
    }

    fn stage_report(&self, stage: Stage, resumed: bool) -> StageReport {
        let entry = self.ledger.stage(stage.name());
        StageReport {
            stage,
            status: entry.as_ref().map_or(EntryStatus::Pending, |e| e.status),
            attempts: entry.as_ref().map_or(0, |e| e.attempts),
            resumed,
            artifact: entry.as_ref().and_then(|e| e.artifact.clone()),
            message: entry.and_then(|e| e.message),
        }
    }

    async fn notify(&self, stage: Stage, status: EntryStatus, message: Option<String>) {
        let event = StageEvent::new(stage.name(), status, message);
        deliver(self.sink.as_ref(), &event, self.notify_timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted behaviour per stage.
    #[derive(Clone)]
    enum Script {
        Succeed,
        TransientThenSucceed(u32),
        AlwaysTransient,
        Fatal,
        Wait,
        /// Cancels the run, then takes a while to wind down
        CancelDuring(CancellationToken, Arc<AtomicBool>),
        /// Completes with one failed region
        Gap,
    }

    fn gap() -> ChunkGap {
        use crate::plan::ChunkRegion;
        use crate::volume::{Axis, Box3};
        ChunkGap {
            region: ChunkRegion {
                index: 1,
                axis: Axis::X,
                inner: Box3::new([0, 0, 10], [4, 4, 20]),
                outer: Box3::new([0, 0, 6], [4, 4, 24]),
            },
            reason: "analysis of chunk 1 failed: boom".into(),
        }
    }

    #[derive(Default)]
    struct ScriptedExecutor {
        scripts: HashMap<Stage, Script>,
        calls: Mutex<Vec<Stage>>,
    }

    impl ScriptedExecutor {
        fn with(mut self, stage: Stage, script: Script) -> Self {
            self.scripts.insert(stage, script);
            self
        }

        fn calls(&self) -> Vec<Stage> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StageExecutor for ScriptedExecutor {
        fn execute<'a>(
            &'a self,
            stage: Stage,
            ctx: &'a StageContext,
        ) -> BoxFuture<'a, Result<StageOutcome>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(stage);
                let done = Ok(StageOutcome::Completed(StageSummary {
                    artifact: Some(format!("{}.out", stage)),
                    ..StageSummary::default()
                }));
                match self.scripts.get(&stage).cloned().unwrap_or(Script::Succeed) {
                    Script::Succeed => done,
                    Script::TransientThenSucceed(n) if ctx.attempt <= n => {
                        Err(PipelineError::transient("connection reset"))
                    }
                    Script::TransientThenSucceed(_) => done,
                    Script::AlwaysTransient => Err(PipelineError::transient("timeout")),
                    Script::Fatal => Err(PipelineError::Bounds {
                        region: "[z 0:5]".into(),
                        shape: "[z 0:4]".into(),
                    }),
                    Script::Wait => Ok(StageOutcome::AwaitingSignal {
                        signal: ALIGNMENT_VERIFIED.into(),
                        message: "verify alignment".into(),
                    }),
                    Script::CancelDuring(token, wound_down) => {
                        token.cancel();
                        ctx.cancel.cancelled().await;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        wound_down.store(true, Ordering::SeqCst);
                        Err(PipelineError::Cancelled(format!("{} interrupted", stage)))
                    }
                    Script::Gap => Ok(StageOutcome::Completed(StageSummary {
                        artifact: Some(format!("{}.out", stage)),
                        message: Some("7 objects, 3 of 4 chunks merged".into()),
                        gaps: vec![gap()],
                        object_count: Some(7),
                    })),
                }
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, EntryStatus)>>,
    }

    impl NotificationSink for RecordingSink {
        fn notify<'a>(&'a self, event: &'a StageEvent) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.events
                    .lock()
                    .unwrap()
                    .push((event.stage.clone(), event.status));
                Ok(())
            })
        }
    }

    struct FailingSink;

    impl NotificationSink for FailingSink {
        fn notify<'a>(&'a self, _event: &'a StageEvent) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async { anyhow::bail!("endpoint down") })
        }
    }

    fn config(dir: &TempDir) -> Arc<Config> {
        let mut config = test_config("/data/brain", dir.path());
        config.stages.transpose = true;
        config.stages.upload = true;
        config.retry.max_retries = 2;
        Arc::new(config)
    }

    fn coordinator(
        config: Arc<Config>,
        ledger: Arc<JobLedger>,
        executor: Arc<ScriptedExecutor>,
    ) -> PipelineCoordinator {
        PipelineCoordinator::new(config, ledger, executor, Arc::new(RecordingSink::default()))
    }

    #[tokio::test]
    async fn test_runs_enabled_stages_in_order() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(JobLedger::in_memory());
        let executor = Arc::new(ScriptedExecutor::default());
        let report = coordinator(config(&dir), ledger.clone(), executor.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(
            executor.calls(),
            vec![Stage::Import, Stage::Transpose, Stage::Process, Stage::Upload]
        );
        assert_eq!(ledger.stage_status("stitch-align"), EntryStatus::Skipped);
        assert_eq!(ledger.stage_status("stitch-fuse"), EntryStatus::Skipped);
        assert_eq!(
            ledger.stage("process").unwrap().artifact.as_deref(),
            Some("process.out")
        );
        assert_eq!(report.stages.len(), 6);
        assert!(report.resume_from.is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(JobLedger::in_memory());
        let executor = Arc::new(
            ScriptedExecutor::default().with(Stage::Import, Script::TransientThenSucceed(2)),
        );
        let report = coordinator(config(&dir), ledger.clone(), executor.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.stage(Stage::Import).unwrap().attempts, 3);
        assert_eq!(ledger.stage_status("import"), EntryStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_retries_exhausted_halts_with_resume_point() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(JobLedger::in_memory());
        let executor =
            Arc::new(ScriptedExecutor::default().with(Stage::Transpose, Script::AlwaysTransient));
        let report = coordinator(config(&dir), ledger.clone(), executor.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Halted);
        assert_eq!(report.resume_from, Some(Stage::Transpose));
        assert_eq!(ledger.stage("transpose").unwrap().attempts, 3);
        assert_eq!(ledger.stage_status("transpose"), EntryStatus::Failed);
        assert!(!executor.calls().contains(&Stage::Process));
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(JobLedger::in_memory());
        let executor = Arc::new(ScriptedExecutor::default().with(Stage::Process, Script::Fatal));
        let report = coordinator(config(&dir), ledger.clone(), executor.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Halted);
        let process = report.stage(Stage::Process).unwrap();
        assert_eq!(process.attempts, 1);
        assert!(process.message.as_deref().unwrap().contains("outside volume bounds"));
    }

    #[tokio::test]
    async fn test_resume_skips_succeeded_stages() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let ledger = Arc::new(JobLedger::open(&config.ledger_path()).unwrap());

        let first = Arc::new(ScriptedExecutor::default().with(Stage::Process, Script::Fatal));
        let report = coordinator(config.clone(), ledger, first).run().await.unwrap();
        assert_eq!(report.resume_from, Some(Stage::Process));

        // A new process picks the job up from the persisted ledger.
        let ledger = Arc::new(JobLedger::open(&config.ledger_path()).unwrap());
        let second = Arc::new(ScriptedExecutor::default());
        let coordinator = coordinator(config, ledger, second.clone());
        assert_eq!(coordinator.resume_point(), Some(Stage::Process));
        let report = coordinator.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(second.calls(), vec![Stage::Process, Stage::Upload]);
        assert!(report.stage(Stage::Import).unwrap().resumed);
        assert!(report.stage(Stage::Transpose).unwrap().resumed);
    }

    #[tokio::test]
    async fn test_stitch_waits_for_signal() {
        let dir = TempDir::new().unwrap();
        let mut config = (*config(&dir)).clone();
        config.stages.stitch = true;
        config.stitch = Some(crate::config::StitchConfig {
            program: "stitcher".into(),
            extra_args: vec![],
            tile_grid: [2, 2],
            tile_size: [256, 256],
            overlap_fraction: 0.1,
            directionality: crate::config::Directionality::RightDown,
            timeout_secs: 60,
        });
        let ledger = Arc::new(JobLedger::in_memory());
        let executor =
            Arc::new(ScriptedExecutor::default().with(Stage::StitchFuse, Script::Wait));
        let report = coordinator(Arc::new(config), ledger.clone(), executor.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::AwaitingSignal);
        assert_eq!(report.resume_from, Some(Stage::StitchFuse));
        assert_eq!(executor.calls(), vec![Stage::StitchAlign, Stage::StitchFuse]);
        assert_eq!(ledger.stage_status("stitch-align"), EntryStatus::Succeeded);
        assert_eq!(ledger.stage_status("stitch-fuse"), EntryStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_during_stage() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let wound_down = Arc::new(AtomicBool::new(false));
        let ledger = Arc::new(JobLedger::in_memory());
        let executor = Arc::new(ScriptedExecutor::default().with(
            Stage::Transpose,
            Script::CancelDuring(cancel.clone(), wound_down.clone()),
        ));
        let report = coordinator(config(&dir), ledger.clone(), executor.clone())
            .with_cancellation(cancel)
            .run()
            .await
            .unwrap();

        // The run waits for the stage to stop instead of dropping it.
        assert!(wound_down.load(Ordering::SeqCst));
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.resume_from, Some(Stage::Transpose));
        assert_eq!(ledger.stage_status("import"), EntryStatus::Succeeded);
        assert_eq!(ledger.stage_status("transpose"), EntryStatus::Pending);
        assert_eq!(executor.calls(), vec![Stage::Import, Stage::Transpose]);
    }

    #[tokio::test]
    async fn test_stage_with_gaps_recorded_as_partial() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let ledger = Arc::new(JobLedger::open(&config.ledger_path()).unwrap());
        let sink = Arc::new(RecordingSink::default());
        let first = Arc::new(ScriptedExecutor::default().with(Stage::Process, Script::Gap));
        let report = PipelineCoordinator::new(config.clone(), ledger.clone(), first.clone(), sink.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::CompletedWithPartialFailures);
        assert_eq!(report.failed_regions, vec![gap()]);
        assert_eq!(report.resume_from, Some(Stage::Process));
        assert_eq!(ledger.stage_status("process"), EntryStatus::Partial);
        assert_eq!(ledger.stage_status("upload"), EntryStatus::Succeeded);
        assert!(first.calls().contains(&Stage::Upload));
        assert!(sink
            .events
            .lock()
            .unwrap()
            .contains(&("process".to_string(), EntryStatus::Partial)));

        // A rerun enters the partial stage again and refreshes what follows it.
        let ledger = Arc::new(JobLedger::open(&config.ledger_path()).unwrap());
        let second = Arc::new(ScriptedExecutor::default());
        let coordinator = coordinator(config, ledger.clone(), second.clone());
        assert_eq!(coordinator.resume_point(), Some(Stage::Process));
        let report = coordinator.run().await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(second.calls(), vec![Stage::Process, Stage::Upload]);
        assert!(report.stage(Stage::Transpose).unwrap().resumed);
        assert!(!report.stage(Stage::Upload).unwrap().resumed);
        assert_eq!(ledger.stage_status("process"), EntryStatus::Succeeded);
        assert!(report.resume_from.is_none());
    }

    #[tokio::test]
    async fn test_notifications_sent_and_failures_ignored() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let executor =
            Arc::new(ScriptedExecutor::default().with(Stage::Import, Script::TransientThenSucceed(1)));
        let coordinator = PipelineCoordinator::new(
            config(&dir),
            Arc::new(JobLedger::in_memory()),
            executor,
            sink.clone(),
        );
        coordinator.run().await.unwrap();

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(
            &events[..3],
            &[
                ("import".to_string(), EntryStatus::Running),
                ("import".to_string(), EntryStatus::Retried),
                ("import".to_string(), EntryStatus::Running),
            ]
        );
        assert_eq!(events.last().unwrap(), &("upload".to_string(), EntryStatus::Succeeded));

        let report = PipelineCoordinator::new(
            config(&dir),
            Arc::new(JobLedger::in_memory()),
            Arc::new(ScriptedExecutor::default()),
            Arc::new(FailingSink),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[test]
    fn test_stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_name(stage.name()), Some(stage));
        }
        assert_eq!(Stage::from_name("segment"), None);
        assert_eq!(
            Stage::Process.and_after(),
            &[Stage::Process, Stage::Upload]
        );
    }

    #[test]
    fn test_report_display_lists_failed_regions() {
        use crate::plan::ChunkRegion;
        use crate::volume::{Axis, Box3};
        let region = ChunkRegion {
            index: 3,
            axis: Axis::X,
            inner: Box3::new([0, 0, 600], [200, 1000, 800]),
            outer: Box3::new([0, 0, 580], [200, 1000, 820]),
        };
        let report = PipelineReport {
            status: RunStatus::CompletedWithPartialFailures,
            stages: vec![],
            failed_regions: vec![ChunkGap {
                region,
                reason: "analysis of chunk 3 failed: boom".into(),
            }],
            object_count: Some(12),
            resume_from: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        let text = report.to_string();
        assert!(text.contains("completed with partial failures"));
        assert!(text.contains("chunk 3"));
        assert!(text.contains("Objects: 12"));
    }
}
