//! Configuration for the volume pipeline.

use crate::error::{PipelineError, Result};
use crate::volume::{Axis, Plane};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a pipeline job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input volume
    pub input: InputConfig,

    /// Analysis profile
    pub profile: ProfileConfig,

    /// Chunk planning
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Worker pool and metrics
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Which stages run
    #[serde(default)]
    pub stages: StagesConfig,

    /// External stitcher (required when the stitch stage is enabled)
    #[serde(default)]
    pub stitch: Option<StitchConfig>,

    /// Transpose/rescale options
    #[serde(default)]
    pub transpose: TransposeConfig,

    /// Remote staging destination (required when the upload stage is enabled)
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    /// Optional notification endpoint
    #[serde(default)]
    pub notify: Option<NotifyConfig>,

    /// Stage-level retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Directory for the ledger and all intermediate artifacts
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

/// Input volume configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Local volume path (`.json` sidecar, `.raw` data or stem) or `s3://` URI
    pub volume: String,

    /// Channel to analyze; all channels when unset
    #[serde(default)]
    pub channel: Option<usize>,

    /// Override voxel resolution in micrometres `[z, y, x]`
    #[serde(default)]
    pub resolution: Option<[f64; 3]>,

    /// Override objective magnification
    #[serde(default)]
    pub magnification: Option<f64>,

    /// Override optical zoom
    #[serde(default)]
    pub zoom: Option<f64>,
}

impl InputConfig {
    /// Whether the input must be fetched from remote storage.
    pub fn is_remote(&self) -> bool {
        self.volume.starts_with("s3://")
    }
}

/// Built-in analyzer implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalyzerKind {
    /// Thresholded local intensity maxima
    #[default]
    Peaks,
}

/// Analysis profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    /// Analyzer implementation
    #[serde(default)]
    pub kind: AnalyzerKind,

    /// Largest radius, in voxels, of any object the analyzer can report.
    /// Required: the overlap margin is validated against it.
    pub max_object_radius: f64,

    /// Minimum intensity for a detection
    #[serde(default = "default_threshold")]
    pub threshold: u16,

    /// Minimum distance in voxels between two reported peaks
    #[serde(default = "default_min_separation")]
    pub min_separation: usize,
}

/// Chunk planning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Axis to split along; the largest axis when unset
    #[serde(default)]
    pub axis: Option<Axis>,

    /// Nominal chunk length along the split axis (overrides memory sizing)
    #[serde(default)]
    pub chunk_size: Option<usize>,

    /// Target number of chunks (overrides memory sizing)
    #[serde(default)]
    pub chunk_count: Option<usize>,

    /// Overlap margin in voxels; the larger of `ceil(max_object_radius)` and
    /// `profile.min_separation + 1` when unset
    #[serde(default)]
    pub overlap_margin: Option<usize>,

    /// Smallest chunk length the memory sizing may choose
    #[serde(default = "default_min_chunk_len")]
    pub min_chunk_len: usize,

    /// Largest chunk length the memory sizing may choose
    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: usize,

    /// Upper bound on the number of chunks; chunks grow instead of exceeding it
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,

    /// Estimated analysis working memory per voxel (bytes)
    #[serde(default = "default_bytes_per_voxel_cost")]
    pub bytes_per_voxel_cost: f64,

    /// Fraction of available memory the pool may use
    #[serde(default = "default_memory_fraction")]
    pub memory_fraction: f64,

    /// Fixed memory budget in GB instead of querying the system
    #[serde(default)]
    pub memory_budget_gb: Option<f64>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            axis: None,
            chunk_size: None,
            chunk_count: None,
            overlap_margin: None,
            min_chunk_len: default_min_chunk_len(),
            max_chunk_len: default_max_chunk_len(),
            max_chunks: default_max_chunks(),
            bytes_per_voxel_cost: default_bytes_per_voxel_cost(),
            memory_fraction: default_memory_fraction(),
            memory_budget_gb: None,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum concurrently running chunks; CPU count when unset
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for CPU-bound work
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Retries per chunk after its first failure
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: usize,

    /// Fraction of failed chunks above which the process stage fails. At
    /// least one failure is always tolerated unless this is 0.
    #[serde(default = "default_max_failed_fraction")]
    pub max_failed_fraction: f64,

    /// Seconds in-flight chunks may run after cancellation before being abandoned
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the process stage
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            worker_threads: None,
            rayon_threads: None,
            chunk_retries: default_chunk_retries(),
            max_failed_fraction: default_max_failed_fraction(),
            cancel_grace_secs: default_cancel_grace_secs(),
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

impl ProcessingConfig {
    /// Effective worker limit.
    pub fn worker_limit(&self) -> usize {
        self.max_workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Number of failed chunks out of `total` the process stage accepts
    /// before halting.
    pub fn tolerated_failures(&self, total: usize) -> usize {
        if self.max_failed_fraction <= 0.0 {
            return 0;
        }
        ((total as f64 * self.max_failed_fraction).floor() as usize).max(1)
    }
}

/// Stage enable flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default)]
    pub stitch: bool,
    #[serde(default = "default_true")]
    pub import: bool,
    #[serde(default)]
    pub transpose: bool,
    #[serde(default = "default_true")]
    pub process: bool,
    #[serde(default)]
    pub upload: bool,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            stitch: false,
            import: true,
            transpose: false,
            process: true,
            upload: false,
        }
    }
}

/// Order in which the stitcher places tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Directionality {
    #[default]
    RightDown,
    RightUp,
    LeftDown,
    LeftUp,
}

impl Directionality {
    pub fn as_str(self) -> &'static str {
        match self {
            Directionality::RightDown => "right-down",
            Directionality::RightUp => "right-up",
            Directionality::LeftDown => "left-down",
            Directionality::LeftUp => "left-up",
        }
    }
}

/// External tile stitcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchConfig {
    /// Stitcher executable
    pub program: String,

    /// Extra arguments passed before the generated ones
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Tile grid `[columns, rows]`
    pub tile_grid: [usize; 2],

    /// Tile size in pixels `[width, height]`
    pub tile_size: [usize; 2],

    /// Fractional overlap between neighbouring tiles
    #[serde(default = "default_tile_overlap")]
    pub overlap_fraction: f64,

    /// Tile placement order
    #[serde(default)]
    pub directionality: Directionality,

    /// Per-phase timeout in seconds
    #[serde(default = "default_stitch_timeout_secs")]
    pub timeout_secs: u64,
}

impl StitchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Transpose/rescale configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransposeConfig {
    /// Output planar orientation
    #[serde(default)]
    pub plane: Plane,

    /// Rescale factor applied to every axis
    #[serde(default)]
    pub rescale: Option<f64>,
}

/// Remote staging destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Local filesystem root used instead of S3 (mutually exclusive with bucket/prefix)
    #[serde(default)]
    pub local_path: Option<String>,

    /// Output S3 bucket
    #[serde(default)]
    pub bucket: Option<String>,

    /// Output key prefix
    #[serde(default)]
    pub prefix: Option<String>,

    /// Glob of files to upload from the output directory
    #[serde(default = "default_include_pattern")]
    pub include_pattern: String,
}

impl RemoteConfig {
    /// Check if the destination is the local filesystem.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Destination as a display string (local path or s3:// URI).
    pub fn path_display(&self) -> String {
        if let Some(path) = &self.local_path {
            path.clone()
        } else {
            format!(
                "s3://{}/{}",
                self.bucket.as_deref().unwrap_or(""),
                self.prefix.as_deref().unwrap_or("")
            )
        }
    }

    fn validate(&self) -> Result<()> {
        match (&self.local_path, &self.bucket, &self.prefix) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(PipelineError::config(
                "remote: cannot specify both local_path and bucket/prefix",
            )),
            (None, None, _) | (None, _, None) => Err(PipelineError::config(
                "remote: must specify either local_path or both bucket and prefix",
            )),
            _ => glob::Pattern::new(&self.include_pattern)
                .map(|_| ())
                .map_err(|e| PipelineError::config(format!("remote.include_pattern: {}", e))),
        }
    }
}

/// Notification endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook URL receiving JSON events
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as u32;
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "json" => Self::from_json(&contents),
            // YAML is a superset of JSON
            _ => Self::from_yaml(&contents),
        }
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| PipelineError::config(e.to_string()))
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PipelineError::config(e.to_string()))
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| PipelineError::config(e.to_string()))
    }

    /// Overlap margin actually used for planning.
    pub fn overlap_margin(&self) -> usize {
        self.chunking
            .overlap_margin
            .unwrap_or_else(|| {
                (self.profile.max_object_radius.ceil() as usize)
                    .max(self.profile.min_separation + 1)
            })
            .max(1)
    }

    /// Path of the job ledger.
    pub fn ledger_path(&self) -> PathBuf {
        self.work_dir.join("ledger.json")
    }

    /// Validate the configuration. Runs before any chunk work begins.
    pub fn validate(&self) -> Result<()> {
        let radius = self.profile.max_object_radius;
        if !radius.is_finite() || radius <= 0.0 {
            return Err(PipelineError::config(
                "profile.max_object_radius must be a positive number",
            ));
        }
        if let Some(margin) = self.chunking.overlap_margin {
            if (margin as f64) < radius {
                return Err(PipelineError::config(format!(
                    "overlap margin {} is smaller than the maximal object radius {}",
                    margin, radius
                )));
            }
        }
        if self.profile.min_separation == 0 {
            return Err(PipelineError::config("profile.min_separation must be > 0"));
        }
        // A maximum on a chunk's last owned voxel is compared against
        // neighbours up to min_separation past it, one voxel beyond the window.
        if self.overlap_margin() <= self.profile.min_separation {
            return Err(PipelineError::config(format!(
                "overlap margin {} must exceed profile.min_separation {}",
                self.overlap_margin(),
                self.profile.min_separation
            )));
        }

        let chunking = &self.chunking;
        if chunking.chunk_size.is_some() && chunking.chunk_count.is_some() {
            return Err(PipelineError::config(
                "chunking: chunk_size and chunk_count are mutually exclusive",
            ));
        }
        if chunking.chunk_size == Some(0) || chunking.chunk_count == Some(0) {
            return Err(PipelineError::config("chunking: chunk size/count must be > 0"));
        }
        if chunking.min_chunk_len == 0 || chunking.min_chunk_len > chunking.max_chunk_len {
            return Err(PipelineError::config(
                "chunking: need 0 < min_chunk_len <= max_chunk_len",
            ));
        }
        if chunking.max_chunks == 0 {
            return Err(PipelineError::config("chunking.max_chunks must be > 0"));
        }
        if !(chunking.bytes_per_voxel_cost > 0.0) {
            return Err(PipelineError::config("chunking.bytes_per_voxel_cost must be > 0"));
        }
        if !(chunking.memory_fraction > 0.0 && chunking.memory_fraction <= 1.0) {
            return Err(PipelineError::config("chunking.memory_fraction must be in (0, 1]"));
        }
        if let Some(gb) = chunking.memory_budget_gb {
            if !(gb > 0.0) {
                return Err(PipelineError::config("chunking.memory_budget_gb must be > 0"));
            }
        }

        let processing = &self.processing;
        if processing.max_workers == Some(0) {
            return Err(PipelineError::config("processing.max_workers must be > 0"));
        }
        if !(0.0..=1.0).contains(&processing.max_failed_fraction) {
            return Err(PipelineError::config(
                "processing.max_failed_fraction must be in [0, 1]",
            ));
        }
        if processing.enable_metrics && processing.metrics_interval_secs == 0 {
            return Err(PipelineError::config("processing.metrics_interval_secs must be > 0"));
        }

        if self.stages.stitch {
            let stitch = self.stitch.as_ref().ok_or_else(|| {
                PipelineError::config("stitch stage enabled but no stitch section given")
            })?;
            if stitch.program.trim().is_empty() {
                return Err(PipelineError::config("stitch.program must not be empty"));
            }
            if stitch.tile_grid.contains(&0) || stitch.tile_size.contains(&0) {
                return Err(PipelineError::config("stitch tile grid and size must be > 0"));
            }
            if !(0.0..1.0).contains(&stitch.overlap_fraction) {
                return Err(PipelineError::config("stitch.overlap_fraction must be in [0, 1)"));
            }
            if stitch.timeout_secs == 0 {
                return Err(PipelineError::config("stitch.timeout_secs must be > 0"));
            }
        }

        if let Some(rescale) = self.transpose.rescale {
            if !(rescale > 0.0) || !rescale.is_finite() {
                return Err(PipelineError::config("transpose.rescale must be > 0"));
            }
        }

        if self.input.is_remote() && !self.stages.import {
            return Err(PipelineError::config(
                "a remote input volume requires the import stage",
            ));
        }
        if let Some(resolution) = self.input.resolution {
            if resolution.iter().any(|&r| !(r > 0.0)) {
                return Err(PipelineError::config("input.resolution must be positive"));
            }
        }

        match (&self.remote, self.stages.upload) {
            (Some(remote), _) => remote.validate()?,
            (None, true) => {
                return Err(PipelineError::config(
                    "upload stage enabled but no remote section given",
                ))
            }
            (None, false) => {}
        }

        if let Some(notify) = &self.notify {
            if !(notify.url.starts_with("http://") || notify.url.starts_with("https://")) {
                return Err(PipelineError::config("notify.url must be an http(s) URL"));
            }
        }

        Ok(())
    }
}

// Default value functions for serde
fn default_work_dir() -> PathBuf { PathBuf::from("volchunk-work") }
fn default_threshold() -> u16 { 1000 }
fn default_min_separation() -> usize { 3 }
fn default_min_chunk_len() -> usize { 16 }
fn default_max_chunk_len() -> usize { 4096 }
fn default_max_chunks() -> usize { 1024 }
fn default_bytes_per_voxel_cost() -> f64 { 16.0 }
fn default_memory_fraction() -> f64 { 0.5 }
fn default_chunk_retries() -> usize { 1 }
fn default_max_failed_fraction() -> f64 { 0.1 }
fn default_cancel_grace_secs() -> u64 { 30 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_tile_overlap() -> f64 { 0.1 }
fn default_stitch_timeout_secs() -> u64 { 6 * 60 * 60 }
fn default_include_pattern() -> String { "*".to_string() }
fn default_notify_timeout_secs() -> u64 { 10 }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }

#[cfg(test)]
pub(crate) fn test_config(volume: &str, work_dir: &Path) -> Config {
    Config {
        input: InputConfig {
            volume: volume.to_string(),
            channel: None,
            resolution: None,
            magnification: None,
            zoom: None,
        },
        profile: ProfileConfig {
            kind: AnalyzerKind::Peaks,
            max_object_radius: 2.0,
            threshold: default_threshold(),
            min_separation: default_min_separation(),
        },
        chunking: ChunkingConfig::default(),
        processing: ProcessingConfig {
            max_workers: Some(2),
            enable_metrics: false,
            ..ProcessingConfig::default()
        },
        stages: StagesConfig::default(),
        stitch: None,
        transpose: TransposeConfig::default(),
        remote: None,
        notify: None,
        retry: RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        },
        work_dir: work_dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
input:
  volume: "/data/brain"
profile:
  max_object_radius: 6.5
"#;

    #[test]
    fn test_minimal_yaml_defaults() {
        let config = Config::from_yaml(MINIMAL_YAML).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.stages.import);
        assert!(config.stages.process);
        assert!(!config.stages.stitch);
        assert_eq!(config.processing.chunk_retries, 1);
        assert_eq!(config.overlap_margin(), 7);
        assert_eq!(config.ledger_path(), PathBuf::from("volchunk-work/ledger.json"));
    }

    #[test]
    fn test_missing_radius_fails_to_load() {
        let yaml = "input:\n  volume: \"/data/brain\"\nprofile:\n  threshold: 10\n";
        assert!(matches!(Config::from_yaml(yaml), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_unknown_profile_kind_rejected() {
        let yaml = "input:\n  volume: v\nprofile:\n  kind: lightsheet\n  max_object_radius: 3\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_overlap_smaller_than_radius_rejected() {
        let mut config = test_config("/data/brain", Path::new("/tmp/w"));
        config.profile.max_object_radius = 10.0;
        config.chunking.overlap_margin = Some(5);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("overlap margin"));
    }

    #[test]
    fn test_default_margin_covers_min_separation() {
        let mut config = test_config("/data/brain", Path::new("/tmp/w"));
        config.profile.max_object_radius = 1.5;
        config.profile.min_separation = 4;
        assert_eq!(config.overlap_margin(), 5);
        assert!(config.validate().is_ok());

        config.chunking.overlap_margin = Some(4);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_separation"));

        config.chunking.overlap_margin = Some(5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tolerated_failures() {
        let mut processing = ProcessingConfig::default();
        assert_eq!(processing.tolerated_failures(4), 1);
        assert_eq!(processing.tolerated_failures(9), 1);
        assert_eq!(processing.tolerated_failures(25), 2);

        processing.max_failed_fraction = 0.5;
        assert_eq!(processing.tolerated_failures(4), 2);

        processing.max_failed_fraction = 0.0;
        assert_eq!(processing.tolerated_failures(4), 0);
    }

    #[test]
    fn test_contradictory_chunk_target_rejected() {
        let mut config = test_config("/data/brain", Path::new("/tmp/w"));
        config.chunking.chunk_size = Some(100);
        config.chunking.chunk_count = Some(4);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage_sections_required() {
        let mut config = test_config("/data/brain", Path::new("/tmp/w"));
        config.stages.stitch = true;
        assert!(config.validate().is_err());

        let mut config = test_config("/data/brain", Path::new("/tmp/w"));
        config.stages.upload = true;
        assert!(config.validate().is_err());
        config.remote = Some(RemoteConfig {
            local_path: Some("/tmp/out".into()),
            bucket: None,
            prefix: None,
            include_pattern: "*.json".into(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_destination_exclusive() {
        let remote = RemoteConfig {
            local_path: Some("/tmp/out".into()),
            bucket: Some("bucket".into()),
            prefix: None,
            include_pattern: "*".into(),
        };
        assert!(remote.validate().is_err());

        let remote = RemoteConfig {
            local_path: None,
            bucket: Some("bucket".into()),
            prefix: Some("runs/brain".into()),
            include_pattern: "*".into(),
        };
        assert!(remote.validate().is_ok());
        assert_eq!(remote.path_display(), "s3://bucket/runs/brain");
    }

    #[test]
    fn test_remote_input_requires_import() {
        let mut config = test_config("s3://bucket/brain.json", Path::new("/tmp/w"));
        config.stages.import = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(20), Duration::from_millis(10000));
    }

    #[test]
    fn test_yaml_round_trip_preserves_stitch() {
        let yaml = r#"
input:
  volume: "/data/tiles"
profile:
  max_object_radius: 4
stages:
  stitch: true
stitch:
  program: "stitcher"
  tile_grid: [4, 3]
  tile_size: [2048, 2048]
  directionality: left-down
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.validate().is_ok());
        let stitch = config.stitch.as_ref().unwrap();
        assert_eq!(stitch.directionality, Directionality::LeftDown);
        assert_eq!(stitch.timeout(), Duration::from_secs(6 * 60 * 60));

        let reloaded = Config::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(reloaded.stitch.unwrap().tile_grid, [4, 3]);
    }
}
