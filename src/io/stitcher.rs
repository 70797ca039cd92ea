//! External tile-stitching tool.
//!
//! The tool runs in two phases. `align` computes tile placements and writes an
//! alignment file; `fuse` consumes that file and writes the fused volume. The
//! child process is killed when its timeout elapses or the run is cancelled.

use crate::config::StitchConfig;
use crate::error::{PipelineError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stitching phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StitchPhase {
    Align,
    Fuse,
}

impl StitchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StitchPhase::Align => "align",
            StitchPhase::Fuse => "fuse",
        }
    }
}

/// Runs the configured stitching program.
#[derive(Debug, Clone)]
pub struct Stitcher {
    config: StitchConfig,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Stitcher {
    pub fn new(config: StitchConfig) -> Self {
        let timeout = config.timeout();
        Self {
            config,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Command-line arguments for one phase. `alignment` is required for fuse.
    pub fn args(
        &self,
        phase: StitchPhase,
        input: &Path,
        output: &Path,
        alignment: Option<&Path>,
    ) -> Vec<String> {
        let c = &self.config;
        let mut args = c.extra_args.clone();
        args.extend([
            "--phase".to_string(),
            phase.as_str().to_string(),
            "--input".to_string(),
            input.display().to_string(),
            "--output".to_string(),
            output.display().to_string(),
            "--grid".to_string(),
            format!("{}x{}", c.tile_grid[0], c.tile_grid[1]),
            "--tile-size".to_string(),
            format!("{}x{}", c.tile_size[0], c.tile_size[1]),
            "--overlap".to_string(),
            c.overlap_fraction.to_string(),
            "--direction".to_string(),
            c.directionality.as_str().to_string(),
        ]);
        if let Some(alignment) = alignment {
            args.push("--alignment".to_string());
            args.push(alignment.display().to_string());
        }
        args
    }

    /// Run one phase and return `output` once the tool has produced it.
    ///
    /// A timeout or non-zero exit is a transient failure so the stage can be
    /// retried. A missing program is a configuration error.
    pub async fn run(
        &self,
        phase: StitchPhase,
        input: &Path,
        output: &Path,
        alignment: Option<&Path>,
    ) -> Result<PathBuf> {
        if phase == StitchPhase::Fuse && alignment.is_none() {
            return Err(PipelineError::config("stitch fuse phase needs an alignment file"));
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let args = self.args(phase, input, output, alignment);
        info!("Running stitcher ({}): {} {}", phase.as_str(), self.config.program, args.join(" "));

        let child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::config(format!(
                    "stitch program '{}' not found",
                    self.config.program
                )),
                _ => PipelineError::Io(e),
            })?;

        let start = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(PipelineError::Cancelled(format!("stitch {}", phase.as_str())));
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => result,
        };

        let out = match result {
            Ok(out) => out?,
            Err(_) => {
                warn!("Stitcher ({}) timed out after {:?}", phase.as_str(), self.timeout);
                return Err(PipelineError::transient(format!(
                    "stitch {} timed out after {:?}",
                    phase.as_str(),
                    self.timeout
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&out.stdout);
        if !stdout.trim().is_empty() {
            debug!("stitcher stdout: {}", stdout.trim());
        }
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(PipelineError::transient(format!(
                "stitch {} exited with {}: {}",
                phase.as_str(),
                out.status,
                last_lines(&stderr, 5)
            )));
        }
        if tokio::fs::metadata(output).await.is_err() && !has_volume(output).await {
            return Err(PipelineError::stage_fatal(
                format!("stitch-{}", phase.as_str()),
                format!("stitcher exited cleanly but {} is missing", output.display()),
            ));
        }

        info!(
            "Stitcher ({}) finished in {:.1}s",
            phase.as_str(),
            start.elapsed().as_secs_f64()
        );
        Ok(output.to_path_buf())
    }
}

/// Fused output may be written as a raw + sidecar pair named after `output`.
async fn has_volume(output: &Path) -> bool {
    let (json, raw) = crate::volume::volume_paths(output);
    tokio::fs::metadata(json).await.is_ok() && tokio::fs::metadata(raw).await.is_ok()
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join(" | ")
}
